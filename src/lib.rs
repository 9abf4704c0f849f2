//! # API Flows
//!
//! A flow execution engine for HTTP API test flows: ordered lists of requests
//! whose URLs, headers and bodies reference caller inputs, environment values,
//! configuration and the outputs of earlier steps.
//!
//! ## Features
//!
//! - **Declarative YAML/JSON flows** - Steps with `{{ scope.path }}` templates
//! - **Sequential or batched parallel execution** - With stop-on-error and dry runs
//! - **Flow state tracking** - Lifecycle records with bounded history
//! - **Sessions** - Long-lived variable state forwarded to a JSON-RPC tool server
//!
//! ## Variable references
//!
//! - `{{input.name}}` - Flow inputs supplied by the caller
//! - `{{env.NAME}}` - Environment values
//! - `{{runtime.key}}` - Runtime values, including `step_<id>_status` and friends
//! - `{{config.timeout}}` - Execution configuration
//! - `{{login.response.token}}` - Output of the step with id `login`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use api_flows::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let flow = FlowLoader::from_yaml_str(r#"
//! steps:
//!   - id: health
//!     method: GET
//!     url: "{{input.base}}/health"
//!     expectedStatus: 200
//! "#)?;
//!
//!     let transport = Arc::new(ReqwestTransport::new(WebConfig::default())?);
//!     let mut pool = VariablePool::new();
//!     pool.set_input("base", "http://localhost:8080");
//!
//!     let result = StepRunner::new(transport)
//!         .run(&flow.steps, pool, &RunOptions::default())
//!         .await;
//!
//!     println!("Flow completed: success={}", result.success);
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod engine;
pub mod workflow;

// Re-export main types
pub use bridge::{BridgeError, HttpTransport, ReqwestTransport, ToolServerBridge, TransportRequest, TransportResponse};
pub use engine::{
    ExecutionMode, ExecutorError, FlowState, FlowStateManager, FlowStatus, MockClock, RunOptions,
    RunResult, SessionController, SessionInfo, StepResult, StepRunner, ValidationReport,
};
pub use workflow::{
    FlowConfig, FlowDefinition, FlowInput, FlowLoader, InputType, LoadError, Operation, Scope,
    ServerConfig, SessionConfig, Step, VariablePool, WebAuthConfig, WebConfig,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bridge::{BridgeError, HttpTransport, ReqwestTransport, ToolServerBridge};
    pub use crate::engine::{
        ExecutionMode, ExecutorError, FlowStateManager, FlowStatus, RunOptions, RunResult,
        SessionController, StepResult, StepRunner,
    };
    pub use crate::workflow::{
        FlowDefinition, FlowLoader, LoadError, Scope, SessionConfig, Step, VariablePool, WebConfig,
    };
}
