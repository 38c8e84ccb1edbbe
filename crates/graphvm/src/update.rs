//! Parameter updates applied after a gradient run.
//!
//! An [`Updater`] names an update kind, its hyper-parameters, and the parameters it owns.
//! Every update kind reads `(param, grad, history)` and produces `(param, history)`; the
//! executor writes both back into the buffers they came from, so a persistent parameter keeps
//! its binding across calls. The history tensor `{param}_history` is created zeroed and marked
//! persistent on first use.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::gradient::gradient_name;
use crate::ops::{ConfigValue, OpConfig, Operator, OperatorRegistry};

/// One parameter and the gradient tensor that drives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTarget {
    pub param: String,
    pub grad: String,
}

/// Update rule plus the parameters it is applied to.
#[derive(Debug, Clone, PartialEq)]
pub struct Updater {
    kind: String,
    config: OpConfig,
    targets: Vec<UpdateTarget>,
}

impl Updater {
    pub fn new(kind: impl Into<String>) -> Self {
        Updater {
            kind: kind.into(),
            config: OpConfig::new(),
            targets: Vec::new(),
        }
    }

    /// Sets a hyper-parameter of the update kind, e.g. `lr` or `momentum`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.config.set(key, value);
        self
    }

    /// Updates `param` from its accumulated gradient `{param}_grad`.
    pub fn param(self, param: impl Into<String>) -> Self {
        let param = param.into();
        let grad = gradient_name(&param);
        self.target(param, grad)
    }

    pub fn target(mut self, param: impl Into<String>, grad: impl Into<String>) -> Self {
        self.targets.push(UpdateTarget {
            param: param.into(),
            grad: grad.into(),
        });
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn config(&self) -> &OpConfig {
        &self.config
    }

    pub fn targets(&self) -> &[UpdateTarget] {
        &self.targets
    }

    /// Instantiates the update kind once per target.
    pub(crate) fn instantiate(&self, registry: &OperatorRegistry) -> Result<Vec<UpdateStep>> {
        if self.targets.is_empty() {
            return Err(Error::invalid_config(self.kind.as_str(), "updater has no parameters"));
        }
        self.targets
            .iter()
            .map(|target| {
                let history = history_name(&target.param);
                let inputs = [target.param.clone(), target.grad.clone(), history.clone()];
                let outputs = [target.param.clone(), history.clone()];
                let op = registry.create(&self.kind, &inputs, &outputs, &self.config)?;
                Ok(UpdateStep {
                    name: format!("{}_update", target.param),
                    param: target.param.clone(),
                    grad: target.grad.clone(),
                    history,
                    op,
                })
            })
            .collect()
    }
}

/// Name of the optimizer state kept next to `param`.
pub fn history_name(param: &str) -> String {
    format!("{param}_history")
}

/// One instantiated update, replayed by the executor after the plan finishes.
pub(crate) struct UpdateStep {
    pub(crate) name: String,
    pub(crate) param: String,
    pub(crate) grad: String,
    pub(crate) history: String,
    pub(crate) op: Arc<dyn Operator>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_targets_its_accumulated_gradient() {
        let updater = Updater::new("Sgd").with("lr", 0.1).param("w").target("b", "b_clipped");
        assert_eq!(
            updater.targets(),
            [
                UpdateTarget {
                    param: "w".into(),
                    grad: "w_grad".into()
                },
                UpdateTarget {
                    param: "b".into(),
                    grad: "b_clipped".into()
                },
            ]
        );
        assert_eq!(history_name("w"), "w_history");
    }

    #[test]
    fn unknown_kind_and_empty_targets_are_rejected() {
        let registry = OperatorRegistry::new();
        let err = Updater::new("Sgd").param("w").instantiate(&registry).err();
        assert!(matches!(err, Some(Error::UnknownKind { .. })));
        let err = Updater::new("Sgd").instantiate(&registry).err();
        assert!(matches!(err, Some(Error::InvalidConfig { .. })));
    }
}
