//! Typed operator configuration and the construction request handed to factories.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One configuration value. Untagged so JSON model definitions map onto it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
}

impl ConfigValue {
    fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Bool(_) => "bool",
            ConfigValue::Int(_) => "int",
            ConfigValue::Float(_) => "float",
            ConfigValue::Str(_) => "string",
            ConfigValue::Ints(_) => "int list",
            ConfigValue::Floats(_) => "float list",
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(v) => write!(f, "{v}"),
            ConfigValue::Int(v) => write!(f, "{v}"),
            ConfigValue::Float(v) => write!(f, "{v}"),
            ConfigValue::Str(v) => write!(f, "{v:?}"),
            ConfigValue::Ints(v) => write!(f, "{v:?}"),
            ConfigValue::Floats(v) => write!(f, "{v:?}"),
        }
    }
}

macro_rules! config_value_from {
    ($($ty:ty => |$v:ident| $expr:expr),* $(,)?) => {
        $(
            impl From<$ty> for ConfigValue {
                fn from($v: $ty) -> Self {
                    $expr
                }
            }
        )*
    };
}

config_value_from! {
    bool => |v| ConfigValue::Bool(v),
    i32 => |v| ConfigValue::Int(i64::from(v)),
    i64 => |v| ConfigValue::Int(v),
    usize => |v| ConfigValue::Int(v as i64),
    f32 => |v| ConfigValue::Float(f64::from(v)),
    f64 => |v| ConfigValue::Float(v),
    &str => |v| ConfigValue::Str(v.to_string()),
    String => |v| ConfigValue::Str(v),
    Vec<i64> => |v| ConfigValue::Ints(v),
    Vec<usize> => |v| ConfigValue::Ints(v.into_iter().map(|x| x as i64).collect()),
    Vec<f64> => |v| ConfigValue::Floats(v),
}

/// Option name to typed value mapping attached to every node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpConfig {
    values: BTreeMap<String, ConfigValue>,
}

impl OpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Construction request handed to an operator factory.
#[derive(Debug, Clone, Copy)]
pub struct OpSpec<'a> {
    pub kind: &'a str,
    pub inputs: &'a [String],
    pub outputs: &'a [String],
    pub config: &'a OpConfig,
}

impl<'a> OpSpec<'a> {
    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::invalid_config(self.kind, reason)
    }

    fn wrong_type(&self, key: &str, expected: &str, found: &ConfigValue) -> Error {
        self.invalid(format!(
            "option `{key}` must be {expected}, found {} ({found})",
            found.type_name()
        ))
    }

    /// Ensures the node declares exactly the expected number of inputs and outputs.
    pub fn expect_arity(&self, inputs: usize, outputs: usize) -> Result<()> {
        if self.inputs.len() != inputs || self.outputs.len() != outputs {
            return Err(self.invalid(format!(
                "expected {inputs} input(s) and {outputs} output(s), got {} and {}",
                self.inputs.len(),
                self.outputs.len()
            )));
        }
        Ok(())
    }

    pub fn f64_opt(&self, key: &str) -> Result<Option<f64>> {
        match self.config.get(key) {
            None => Ok(None),
            Some(ConfigValue::Float(v)) => Ok(Some(*v)),
            Some(ConfigValue::Int(v)) => Ok(Some(*v as f64)),
            Some(other) => Err(self.wrong_type(key, "a number", other)),
        }
    }

    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64> {
        Ok(self.f64_opt(key)?.unwrap_or(default))
    }

    pub fn require_f64(&self, key: &str) -> Result<f64> {
        self.f64_opt(key)?
            .ok_or_else(|| self.invalid(format!("missing required option `{key}`")))
    }

    pub fn i64_or(&self, key: &str, default: i64) -> Result<i64> {
        match self.config.get(key) {
            None => Ok(default),
            Some(ConfigValue::Int(v)) => Ok(*v),
            Some(other) => Err(self.wrong_type(key, "an integer", other)),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.config.get(key) {
            None => Ok(default),
            Some(ConfigValue::Bool(v)) => Ok(*v),
            Some(other) => Err(self.wrong_type(key, "a bool", other)),
        }
    }

    pub fn str_opt(&self, key: &str) -> Result<Option<&'a str>> {
        match self.config.get(key) {
            None => Ok(None),
            Some(ConfigValue::Str(v)) => Ok(Some(v.as_str())),
            Some(other) => Err(self.wrong_type(key, "a string", other)),
        }
    }

    /// Non-negative integer list, e.g. a target shape.
    pub fn require_dims(&self, key: &str) -> Result<Vec<usize>> {
        match self.config.get(key) {
            None => Err(self.invalid(format!("missing required option `{key}`"))),
            Some(ConfigValue::Ints(values)) => values
                .iter()
                .map(|v| {
                    usize::try_from(*v)
                        .map_err(|_| self.invalid(format!("option `{key}` has negative entry {v}")))
                })
                .collect(),
            Some(other) => Err(self.wrong_type(key, "an integer list", other)),
        }
    }
}
