//! Bridge modules for external service communication
//!
//! This module provides the collaborators the engine talks to:
//! - `web`: outbound HTTP requests via reqwest, behind the `HttpTransport` trait
//! - `rpc`: line-delimited JSON-RPC framing and request correlation
//! - `tool_server`: a protocol server subprocess reached over stdin/stdout

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub mod rpc;
pub mod tool_server;
pub mod web;

pub use rpc::{PendingRequests, RpcRequest, RpcResponse};
pub use tool_server::ToolServerBridge;
pub use web::ReqwestTransport;

/// Common error type for bridge operations
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to start server: {0}")]
    StartupFailed(String),

    #[error("Server disconnected")]
    Disconnected,

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Session closed")]
    SessionClosed,

    #[error("Server not running")]
    NotRunning,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// A request handed to the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    pub timeout_ms: u64,
}

/// What the transport observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportResponse {
    /// Generic success as judged by the transport (2xx for HTTP)
    pub success: bool,
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub data: Value,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl TransportResponse {
    /// Response with a status and JSON body; success follows the status class
    pub fn with_status(status: u16, data: Value) -> Self {
        Self {
            success: (200..300).contains(&status),
            status,
            status_text: String::new(),
            headers: HashMap::new(),
            data,
            elapsed_ms: 0,
            error: None,
        }
    }
}

/// Outbound HTTP collaborator used by the step runner
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send one request. Network and timeout failures are returned as `Err`;
    /// any response that reached the server, whatever its status, is `Ok`.
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, BridgeError>;
}
