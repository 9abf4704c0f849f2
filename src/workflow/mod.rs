//! Flow types and variable resolution
//!
//! This module contains all types for defining flows and resolving variables:
//! - `flow` - FlowDefinition, Step, FlowConfig and input declarations
//! - `context` - VariablePool and the Scope enum
//! - `expressions` - Interpolation of `{{ scope.path }}` references
//! - `loader` - Load flow definitions from files and directories
//! - `session_config` - Session configuration loaded from YAML

pub mod context;
pub mod expressions;
pub mod flow;
pub mod loader;
pub mod session_config;

// Re-export all public types for convenience
pub use context::{Scope, VariablePool};
pub use expressions::{
    extract_references, interpolate_value, resolve, try_resolve_reference, validate_references,
    variable_types, InterpolationError, ReferenceReport, VariableTypes,
};
pub use flow::{FlowConfig, FlowDefinition, FlowInput, InputType, Operation, Step};
pub use loader::{FlowLoader, LoadError};
pub use session_config::{ServerConfig, SessionConfig, WebAuthConfig, WebConfig};
