//! Flow, Step, and input declarations
//!
//! Flow definitions are plain nested data, loaded from YAML or JSON:
//!
//! ```yaml
//! version: "1.0"
//! name: create-user
//! config:
//!   timeout: 10000
//!   stopOnError: true
//!   parallel: false
//! flow_inputs:
//!   - name: base
//!     type: string
//!     required: true
//! steps:
//!   - id: create
//!     name: Create user
//!     method: POST
//!     url: "{{input.base}}/users"
//!     body:
//!       name: "{{input.name}}"
//!     expectedStatus: 201
//!   - id: fetch
//!     method: GET
//!     url: "{{input.base}}/users/{{create.response.id}}"
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

// ============================================================================
// Flow
// ============================================================================

/// A complete flow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(default = "default_version")]
    pub version: String,

    /// Optional human-readable name
    #[serde(default)]
    pub name: Option<String>,

    /// Steps in execution order
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Execution configuration
    #[serde(default)]
    pub config: Option<FlowConfig>,

    /// Named, typed inputs the caller supplies
    #[serde(default, alias = "flowInputs")]
    pub flow_inputs: Vec<FlowInput>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl FlowDefinition {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            version: default_version(),
            name: None,
            steps,
            config: None,
            flow_inputs: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: FlowConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_input(mut self, input: FlowInput) -> Self {
        self.flow_inputs.push(input);
        self
    }

    /// Apply declared defaults to caller inputs and check required inputs and
    /// types. Undeclared inputs are passed through untouched.
    pub fn resolve_inputs(&self, provided: &Map<String, Value>) -> Result<Map<String, Value>, Vec<String>> {
        let mut resolved = provided.clone();
        let mut errors = Vec::new();

        for decl in &self.flow_inputs {
            match provided.get(&decl.name) {
                Some(value) if !value.is_null() => {
                    if !decl.input_type.accepts(value) {
                        errors.push(format!(
                            "Input '{}' must be of type {}, got {}",
                            decl.name,
                            decl.input_type.as_str(),
                            json_type_name(value)
                        ));
                    }
                }
                _ => {
                    if let Some(default) = &decl.default {
                        resolved.insert(decl.name.clone(), default.clone());
                    } else if decl.required {
                        errors.push(format!("Missing required input '{}'", decl.name));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(resolved)
        } else {
            Err(errors)
        }
    }
}

/// Execution settings declared by a flow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfig {
    /// Default per-step timeout in milliseconds
    pub timeout: Option<u64>,

    pub stop_on_error: Option<bool>,

    /// Run steps in concurrent batches instead of one by one
    #[serde(default)]
    pub parallel: bool,

    pub max_concurrency: Option<usize>,
}

// ============================================================================
// Inputs
// ============================================================================

/// Declared type of a flow input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::String => "string",
            InputType::Number => "number",
            InputType::Boolean => "boolean",
            InputType::Object => "object",
            InputType::Array => "array",
            InputType::Any => "any",
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Boolean => value.is_boolean(),
            InputType::Object => value.is_object(),
            InputType::Array => value.is_array(),
            InputType::Any => true,
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A named input declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowInput {
    pub name: String,

    #[serde(rename = "type", default)]
    pub input_type: InputType,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub description: Option<String>,
}

impl FlowInput {
    pub fn new(name: impl Into<String>, input_type: InputType) -> Self {
        Self {
            name: name.into(),
            input_type,
            required: false,
            default: None,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

// ============================================================================
// Step
// ============================================================================

/// One planned HTTP call within a flow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique identifier within the flow; also the step-output scope name
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub method: Option<String>,

    /// URL template
    pub url: Option<String>,

    /// Reference to a pre-defined operation supplying method/url/headers/body
    #[serde(alias = "endpoint", alias = "endpointId")]
    pub operation: Option<String>,

    /// Header templates
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Body template; strings are interpolated as text, structures field by field
    pub body: Option<Value>,

    /// Timeout in milliseconds
    pub timeout: Option<u64>,

    pub expected_status: Option<u16>,

    /// Output name -> dotted path into the step output (e.g. `response.token`)
    #[serde(default)]
    pub extract: HashMap<String, String>,
}

impl Step {
    pub fn new(id: impl Into<String>, method: impl Into<String>, url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            method: Some(method.into()),
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Step resolved through a pre-defined operation
    pub fn operation(id: impl Into<String>, operation: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            operation: Some(operation.into()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    pub fn expect_status(mut self, status: u16) -> Self {
        self.expected_status = Some(status);
        self
    }

    pub fn extract(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.extract.insert(name.into(), path.into());
        self
    }

    /// Name for logs and results, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A reusable request template a step can reference by id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Operation {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl Operation {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }
}
