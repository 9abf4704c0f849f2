//! Variable pool for flow runtime
//!
//! This module contains the layered variable state used during flow execution:
//! caller inputs, environment values, runtime values, execution configuration
//! and per-step outputs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// The five variable namespaces of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Flow-level inputs supplied by the caller
    Input,
    /// Environment variables
    Env,
    /// Ad-hoc values set during a session or a run
    Runtime,
    /// Execution configuration (timeout, concurrency, ...)
    Config,
    /// Recorded step outputs, keyed by step id
    Steps,
}

impl Scope {
    pub const ALL: [Scope; 5] = [
        Scope::Input,
        Scope::Env,
        Scope::Runtime,
        Scope::Config,
        Scope::Steps,
    ];

    /// Name used in `{{scope.key}}` references
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Input => "input",
            Scope::Env => "env",
            Scope::Runtime => "runtime",
            Scope::Config => "config",
            Scope::Steps => "steps",
        }
    }

    /// Scope selected by the first segment of a reference, if it names one of
    /// the four keyed scopes. Step outputs are addressed by step id instead.
    pub fn from_reference_prefix(segment: &str) -> Option<Scope> {
        match segment {
            "input" => Some(Scope::Input),
            "env" => Some(Scope::Env),
            "runtime" => Some(Scope::Runtime),
            "config" => Some(Scope::Config),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "input" | "inputs" | "flowinputs" | "flow_inputs" => Ok(Scope::Input),
            "env" | "environment" => Ok(Scope::Env),
            "runtime" => Ok(Scope::Runtime),
            "config" => Ok(Scope::Config),
            "steps" | "stepoutputs" | "step_outputs" => Ok(Scope::Steps),
            other => Err(format!("unknown scope: {}", other)),
        }
    }
}

/// Layered variable state read by the interpolator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariablePool {
    #[serde(rename = "flowInputs", alias = "input", default)]
    pub input: Map<String, Value>,

    #[serde(rename = "environment", alias = "env", default)]
    pub env: Map<String, Value>,

    #[serde(default)]
    pub runtime: Map<String, Value>,

    #[serde(default)]
    pub config: Map<String, Value>,

    /// Step outputs (step_id -> output object)
    #[serde(rename = "stepOutputs", alias = "steps", default)]
    pub steps: HashMap<String, Value>,
}

impl VariablePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map backing one of the keyed scopes. Step outputs are not a plain
    /// string-keyed map of scalars, so `Scope::Steps` yields `None`.
    pub fn scope(&self, scope: Scope) -> Option<&Map<String, Value>> {
        match scope {
            Scope::Input => Some(&self.input),
            Scope::Env => Some(&self.env),
            Scope::Runtime => Some(&self.runtime),
            Scope::Config => Some(&self.config),
            Scope::Steps => None,
        }
    }

    fn scope_mut(&mut self, scope: Scope) -> Option<&mut Map<String, Value>> {
        match scope {
            Scope::Input => Some(&mut self.input),
            Scope::Env => Some(&mut self.env),
            Scope::Runtime => Some(&mut self.runtime),
            Scope::Config => Some(&mut self.config),
            Scope::Steps => None,
        }
    }

    /// Get a value from a keyed scope
    pub fn get(&self, scope: Scope, key: &str) -> Option<&Value> {
        self.scope(scope)?.get(key)
    }

    /// Set a value in a keyed scope. Returns false for `Scope::Steps`,
    /// which is written through `set_step_output`.
    pub fn set(&mut self, scope: Scope, key: &str, value: Value) -> bool {
        match self.scope_mut(scope) {
            Some(map) => {
                map.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Merge entries into a keyed scope, overwriting existing keys
    pub fn merge(&mut self, scope: Scope, values: Map<String, Value>) -> bool {
        match self.scope_mut(scope) {
            Some(map) => {
                for (key, value) in values {
                    map.insert(key, value);
                }
                true
            }
            None => false,
        }
    }

    /// Merge every scope of `other` into this pool, `other` winning on conflicts
    pub fn merge_pool(&mut self, other: &VariablePool) {
        for scope in [Scope::Input, Scope::Env, Scope::Runtime, Scope::Config] {
            if let Some(values) = other.scope(scope) {
                self.merge(scope, values.clone());
            }
        }
        self.steps
            .extend(other.steps.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Set an input value
    pub fn set_input(&mut self, key: &str, value: impl Into<Value>) {
        self.input.insert(key.to_string(), value.into());
    }

    /// Set an environment variable
    pub fn set_env(&mut self, key: &str, value: impl Into<Value>) {
        self.env.insert(key.to_string(), value.into());
    }

    /// Set a runtime variable
    pub fn set_runtime(&mut self, key: &str, value: impl Into<Value>) {
        self.runtime.insert(key.to_string(), value.into());
    }

    /// Set a config value
    pub fn set_config(&mut self, key: &str, value: impl Into<Value>) {
        self.config.insert(key.to_string(), value.into());
    }

    /// Replace the output object of a step
    pub fn set_step_output(&mut self, step_id: &str, output: Value) {
        self.steps.insert(step_id.to_string(), output);
    }

    /// Get the output object of a step
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id)
    }

    /// Empty one scope
    pub fn clear(&mut self, scope: Scope) {
        match scope {
            Scope::Input => self.input.clear(),
            Scope::Env => self.env.clear(),
            Scope::Runtime => self.runtime.clear(),
            Scope::Config => self.config.clear(),
            Scope::Steps => self.steps.clear(),
        }
    }

    /// Number of entries in a scope
    pub fn len(&self, scope: Scope) -> usize {
        match scope {
            Scope::Steps => self.steps.len(),
            other => self.scope(other).map(|m| m.len()).unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        Scope::ALL.iter().all(|s| self.len(*s) == 0)
    }

    /// Configured timeout in milliseconds, if `config.timeout` holds a number
    pub fn config_timeout_ms(&self) -> Option<u64> {
        self.config.get("timeout").and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    /// Serialized snapshot of every scope
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
