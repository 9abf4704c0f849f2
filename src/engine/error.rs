//! Executor error types

use crate::bridge::BridgeError;
use crate::workflow::LoadError;

/// Errors that can occur while running flows or managing their state
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Load error: {0}")]
    LoadError(#[from] LoadError),

    #[error("Bridge error: {0}")]
    BridgeError(#[from] BridgeError),

    #[error("Invalid flow definition: {}", .0.join("; "))]
    InvalidFlow(Vec<String>),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Invalid flow state: {0}")]
    InvalidState(String),

    #[error("Step task failed: {0}")]
    TaskFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}
