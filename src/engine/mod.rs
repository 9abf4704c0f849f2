//! Flow execution engine module
//!
//! This module contains:
//! - `executor` - The step runner
//! - `error` - Executor error types
//! - `result` - Step and run result types
//! - `state_manager` - Flow lifecycle tracking and history
//! - `session` - Long-lived session state and tool forwarding
//! - `mock_clock` - Mock clock for controlling virtual time

pub mod error;
pub mod executor;
pub mod mock_clock;
pub mod result;
pub mod session;
pub mod state_manager;

pub use error::ExecutorError;
pub use executor::{ExecutionContext, ExecutionMode, RunOptions, StepRunner};
pub use mock_clock::{parse_duration, ClockError, MockClock};
pub use result::{ResolvedRequest, ResponseSummary, RunResult, StepResult};
pub use session::{ScopeCounts, SessionController, SessionInfo};
pub use state_manager::{
    FlowState, FlowStateManager, FlowStateUpdate, FlowStatistics, FlowStatus, ValidationReport,
};
