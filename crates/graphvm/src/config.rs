//! Engine-wide configuration.
//!
//! Values come from defaults, an optional JSON document, and finally `GRAPHVM_*` environment
//! overrides.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::env;
use crate::error::{Error, Result};
use crate::tensor::Device;

/// Default number of specialised plans a [`Function`](crate::Function) keeps before LRU eviction.
pub const DEFAULT_PLAN_CACHE_CAPACITY: usize = 64;

/// Byte budget enforced by the workspace allocator for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBudget {
    pub device: Device,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Keep every intermediate bound after a run and disable buffer reuse.
    pub debug_mode: bool,
    /// Let gradient tensors share buffers with other intermediates.
    pub share_grads: bool,
    pub plan_cache_capacity: usize,
    /// Fail gradient construction on unreachable terminals instead of zero-filling.
    pub strict_gradients: bool,
    pub device_memory: Vec<DeviceBudget>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            debug_mode: false,
            share_grads: true,
            plan_cache_capacity: DEFAULT_PLAN_CACHE_CAPACITY,
            strict_gradients: false,
            device_memory: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| Error::invalid_config("engine", format!("malformed config: {err}")))
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(flag) = env::bool_var(env::DEBUG_MODE) {
            self.debug_mode = flag;
        }
        if let Some(flag) = env::bool_var(env::SHARE_GRADS) {
            self.share_grads = flag;
        }
        if let Some(flag) = env::bool_var(env::STRICT_GRADIENTS) {
            self.strict_gradients = flag;
        }
        if let Some(capacity) = env::usize_var(env::PLAN_CACHE) {
            self.plan_cache_capacity = capacity;
        }
        self
    }

    pub fn with_debug_mode(mut self, enabled: bool) -> Self {
        self.debug_mode = enabled;
        self
    }

    pub fn with_share_grads(mut self, enabled: bool) -> Self {
        self.share_grads = enabled;
        self
    }

    pub fn with_strict_gradients(mut self, enabled: bool) -> Self {
        self.strict_gradients = enabled;
        self
    }

    pub fn with_device_budget(mut self, device: Device, bytes: u64) -> Self {
        self.device_memory.retain(|budget| budget.device != device);
        self.device_memory.push(DeviceBudget { device, bytes });
        self
    }

    pub(crate) fn budgets(&self) -> HashMap<Device, u64> {
        self.device_memory
            .iter()
            .map(|budget| (budget.device, budget.bytes))
            .collect()
    }
}
