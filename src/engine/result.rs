//! Execution result types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::workflow::VariablePool;

/// The concrete request built for a step after interpolation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    pub timeout_ms: u64,
}

/// What the transport observed for a dispatched request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSummary {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one step attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub step_name: String,
    pub success: bool,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ResolvedRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    /// A step that failed before any network attempt
    pub fn failed(step_id: &str, step_name: &str, error: impl Into<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            success: false,
            elapsed_ms: 0,
            request: None,
            response: None,
            error: Some(error.into()),
        }
    }
}

/// Result of a whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    pub results: Vec<StepResult>,
    pub elapsed_ms: u64,
    pub errors: Vec<String>,
    pub variables: VariablePool,
    /// Identifier of this run
    pub run_id: String,
}

impl RunResult {
    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.results.iter().filter(|r| !r.success)
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }
}
