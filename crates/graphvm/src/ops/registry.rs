//! Operator registry mapping kind names to factories.
//!
//! The registry is an explicit object owned by the session and shared by reference with every
//! graph builder. There is no process-wide instance: two sessions can carry different kinds.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::debug;

use super::config::{OpConfig, OpSpec};
use super::Operator;
use crate::error::{Error, Result};

/// Factory that validates a construction request and produces an operator instance.
pub type OperatorFactory = Box<dyn Fn(&OpSpec<'_>) -> Result<Arc<dyn Operator>> + Send + Sync>;

/// Kind name to factory mapping.
pub struct OperatorRegistry {
    factories: RwLock<HashMap<String, OperatorFactory>>,
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorRegistry {
    /// Creates a registry preloaded with the engine's built-in kinds.
    pub fn new() -> Self {
        let registry = Self::empty();
        super::builtin::install(&registry);
        registry
    }

    /// Creates a registry with no kinds at all.
    pub fn empty() -> Self {
        OperatorRegistry {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Installs `factory` for `kind`. Re-registering a kind fails and keeps the first factory.
    pub fn register<F>(&self, kind: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&OpSpec<'_>) -> Result<Arc<dyn Operator>> + Send + Sync + 'static,
    {
        let kind = kind.into();
        let mut factories = self.factories.write().expect("registry lock poisoned");
        if factories.contains_key(&kind) {
            return Err(Error::DuplicateKind { kind });
        }
        debug!(kind = %kind, "registered operator kind");
        factories.insert(kind, Box::new(factory));
        Ok(())
    }

    /// Instantiates `kind` for a node with the given tensor names and configuration.
    pub fn create(
        &self,
        kind: &str,
        inputs: &[String],
        outputs: &[String],
        config: &OpConfig,
    ) -> Result<Arc<dyn Operator>> {
        let factories = self.factories.read().expect("registry lock poisoned");
        let factory = factories.get(kind).ok_or_else(|| Error::UnknownKind {
            kind: kind.to_string(),
        })?;
        factory(&OpSpec {
            kind,
            inputs,
            outputs,
            config,
        })
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories
            .read()
            .expect("registry lock poisoned")
            .contains_key(kind)
    }

    /// Registered kinds in sorted order.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .factories
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
