use std::env;

pub(crate) const DEBUG_MODE: &str = "GRAPHVM_DEBUG_MODE";
pub(crate) const SHARE_GRADS: &str = "GRAPHVM_SHARE_GRADS";
pub(crate) const STRICT_GRADIENTS: &str = "GRAPHVM_STRICT_GRADIENTS";
pub(crate) const PLAN_CACHE: &str = "GRAPHVM_PLAN_CACHE";

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Reads a boolean flag; unset or blank variables yield `None`.
pub(crate) fn bool_var(name: &str) -> Option<bool> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    }
}

/// Reads a positive integer; malformed values are ignored.
pub(crate) fn usize_var(name: &str) -> Option<usize> {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
}
