//! Flow State Manager - Lifecycle records of flow runs
//!
//! Each flow id has at most one active record. Records move through
//! `idle -> running -> {completed, failed, stopped}`; on reaching a terminal
//! status they leave the active set and join a bounded per-id history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info};

use super::error::ExecutorError;
use super::mock_clock::MockClock;
use super::result::StepResult;
use crate::workflow::expressions::is_reserved_prefix;
use crate::workflow::{FlowDefinition, VariablePool};

pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

const MIN_RECOMMENDED_TIMEOUT_MS: u64 = 1000;
const MAX_RECOMMENDED_CONCURRENCY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Stopped
        )
    }
}

/// Lifecycle record of one flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    pub flow_id: String,
    pub status: FlowStatus,
    pub total_steps: usize,
    pub current_step: usize,
    #[serde(default)]
    pub variables: VariablePool,
    #[serde(default)]
    pub results: Vec<StepResult>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl FlowState {
    fn new(flow_id: &str, total_steps: usize, now: DateTime<Utc>) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            status: FlowStatus::Idle,
            total_steps,
            current_step: 0,
            variables: VariablePool::default(),
            results: Vec::new(),
            errors: Vec::new(),
            created_at: now,
            started_at: None,
            ended_at: None,
        }
    }

    /// Time from start to end, or to `now` while still running
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        match self.started_at {
            Some(started) => (self.ended_at.unwrap_or(now) - started)
                .num_milliseconds()
                .max(0) as u64,
            None => 0,
        }
    }
}

/// Partial update applied by `FlowStateManager::update`
#[derive(Debug, Clone, Default)]
pub struct FlowStateUpdate {
    pub status: Option<FlowStatus>,
    pub total_steps: Option<usize>,
    pub current_step: Option<usize>,
    pub variables: Option<VariablePool>,
}

/// Counts across active records and retained history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStatistics {
    pub active: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
    pub total_executions: usize,
}

/// Outcome of checking a flow definition before it runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Tracks active flows and their completed runs
#[derive(Debug)]
pub struct FlowStateManager {
    active: HashMap<String, FlowState>,
    history: HashMap<String, VecDeque<FlowState>>,
    history_limit: usize,
    max_age: Duration,
    clock: MockClock,
}

impl Default for FlowStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowStateManager {
    pub fn new() -> Self {
        Self::with_clock(MockClock::new())
    }

    /// Use a shared clock, typically a virtual one in tests
    pub fn with_clock(clock: MockClock) -> Self {
        Self {
            active: HashMap::new(),
            history: HashMap::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_age: DEFAULT_MAX_AGE,
            clock,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn clock(&self) -> &MockClock {
        &self.clock
    }

    /// Create (or replace) the active record for a flow
    pub fn create(&mut self, flow_id: &str, total_steps: usize) -> &FlowState {
        let state = FlowState::new(flow_id, total_steps, self.clock.now());
        if self.active.insert(flow_id.to_string(), state).is_some() {
            debug!("Replaced active record for flow '{}'", flow_id);
        }
        &self.active[flow_id]
    }

    pub fn get(&self, flow_id: &str) -> Option<&FlowState> {
        self.active.get(flow_id)
    }

    pub fn get_or_create(&mut self, flow_id: &str, total_steps: usize) -> &FlowState {
        let now = self.clock.now();
        self.active
            .entry(flow_id.to_string())
            .or_insert_with(|| FlowState::new(flow_id, total_steps, now))
    }

    fn active_mut(&mut self, flow_id: &str) -> Result<&mut FlowState, ExecutorError> {
        self.active
            .get_mut(flow_id)
            .ok_or_else(|| ExecutorError::FlowNotFound(flow_id.to_string()))
    }

    /// Apply a partial update. A terminal status finalizes the record.
    pub fn update(&mut self, flow_id: &str, update: FlowStateUpdate) -> Result<(), ExecutorError> {
        let state = self.active_mut(flow_id)?;
        if let Some(total) = update.total_steps {
            state.total_steps = total;
        }
        if let Some(current) = update.current_step {
            state.current_step = current;
        }
        if let Some(variables) = update.variables {
            state.variables = variables;
        }

        match update.status {
            Some(status) if status.is_terminal() => {
                self.finalize(flow_id, status)?;
            }
            Some(status) => self.active_mut(flow_id)?.status = status,
            None => {}
        }
        Ok(())
    }

    /// Begin (or restart) a run of the flow
    pub fn start(&mut self, flow_id: &str, total_steps: usize) -> &FlowState {
        let now = self.clock.now();
        let state = self
            .active
            .entry(flow_id.to_string())
            .or_insert_with(|| FlowState::new(flow_id, total_steps, now));

        state.status = FlowStatus::Running;
        state.total_steps = total_steps;
        state.current_step = 0;
        state.results.clear();
        state.errors.clear();
        state.started_at = Some(now);
        state.ended_at = None;

        info!("Flow '{}' started ({} steps)", flow_id, total_steps);
        state
    }

    /// Record a step result and advance the step counter
    pub fn add_result(&mut self, flow_id: &str, result: StepResult) -> Result<(), ExecutorError> {
        let state = self.active_mut(flow_id)?;
        state.results.push(result);
        state.current_step += 1;
        Ok(())
    }

    pub fn add_error(&mut self, flow_id: &str, error: impl Into<String>) -> Result<(), ExecutorError> {
        self.active_mut(flow_id)?.errors.push(error.into());
        Ok(())
    }

    pub fn merge_variables(
        &mut self,
        flow_id: &str,
        variables: &VariablePool,
    ) -> Result<(), ExecutorError> {
        self.active_mut(flow_id)?.variables.merge_pool(variables);
        Ok(())
    }

    /// Finish a running flow as completed or failed and move it to history
    pub fn complete(&mut self, flow_id: &str, success: bool) -> Result<FlowState, ExecutorError> {
        let status = self.active_mut(flow_id)?.status;
        if status != FlowStatus::Running {
            return Err(ExecutorError::InvalidState(format!(
                "flow '{}' is {:?}, not running",
                flow_id, status
            )));
        }
        let terminal = if success {
            FlowStatus::Completed
        } else {
            FlowStatus::Failed
        };
        self.finalize(flow_id, terminal)
    }

    /// Stop an idle or running flow and move it to history
    pub fn stop(&mut self, flow_id: &str) -> Result<FlowState, ExecutorError> {
        self.active_mut(flow_id)?;
        self.finalize(flow_id, FlowStatus::Stopped)
    }

    fn finalize(&mut self, flow_id: &str, status: FlowStatus) -> Result<FlowState, ExecutorError> {
        let mut state = self
            .active
            .remove(flow_id)
            .ok_or_else(|| ExecutorError::FlowNotFound(flow_id.to_string()))?;

        state.status = status;
        state.ended_at = Some(self.clock.now());
        info!(
            "Flow '{}' {:?} after {}ms",
            flow_id,
            status,
            state.elapsed_ms(self.clock.now())
        );

        self.push_history(state.clone());
        Ok(state)
    }

    fn push_history(&mut self, state: FlowState) {
        let entries = self.history.entry(state.flow_id.clone()).or_default();
        entries.push_back(state);
        while entries.len() > self.history_limit {
            entries.pop_front();
        }
    }

    /// Terminal runs of a flow, oldest first
    pub fn history(&self, flow_id: &str) -> Vec<FlowState> {
        self.history
            .get(flow_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Elapsed time of the active run, or of the latest recorded one
    pub fn elapsed_ms(&self, flow_id: &str) -> Option<u64> {
        let now = self.clock.now();
        self.lookup(flow_id).map(|state| state.elapsed_ms(now))
    }

    fn lookup(&self, flow_id: &str) -> Option<&FlowState> {
        self.active
            .get(flow_id)
            .or_else(|| self.history.get(flow_id).and_then(|h| h.back()))
    }

    pub fn statistics(&self) -> FlowStatistics {
        let mut stats = FlowStatistics {
            active: self.active.len(),
            running: self
                .active
                .values()
                .filter(|s| s.status == FlowStatus::Running)
                .count(),
            ..FlowStatistics::default()
        };

        for state in self.history.values().flatten() {
            match state.status {
                FlowStatus::Completed => stats.completed += 1,
                FlowStatus::Failed => stats.failed += 1,
                FlowStatus::Stopped => stats.stopped += 1,
                _ => {}
            }
        }
        stats.total_executions = stats.completed + stats.failed + stats.stopped;
        stats
    }

    /// Serialize the active record, or the latest recorded run
    pub fn export(&self, flow_id: &str) -> Result<Value, ExecutorError> {
        let state = self
            .lookup(flow_id)
            .ok_or_else(|| ExecutorError::FlowNotFound(flow_id.to_string()))?;

        let mut value = serde_json::to_value(state)
            .map_err(|e| ExecutorError::InvalidState(e.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.insert(
                "elapsedMs".to_string(),
                state.elapsed_ms(self.clock.now()).into(),
            );
        }
        Ok(value)
    }

    /// Load an exported record. Terminal records go to history.
    pub fn import(&mut self, value: Value) -> Result<String, ExecutorError> {
        let state: FlowState = serde_json::from_value(value)
            .map_err(|e| ExecutorError::InvalidState(format!("cannot import flow state: {}", e)))?;
        let flow_id = state.flow_id.clone();

        if state.status.is_terminal() {
            self.push_history(state);
        } else {
            self.active.insert(flow_id.clone(), state);
        }
        Ok(flow_id)
    }

    /// Drop active records started longer than `max_age` ago.
    /// Returns how many were removed.
    pub fn cleanup(&mut self) -> usize {
        let now = self.clock.now();
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX);

        let before = self.active.len();
        self.active.retain(|flow_id, state| {
            let since = state.started_at.unwrap_or(state.created_at);
            let keep = now - since <= max_age;
            if !keep {
                debug!("Discarding stale flow '{}'", flow_id);
            }
            keep
        });

        for entries in self.history.values_mut() {
            while entries.len() > self.history_limit {
                entries.pop_front();
            }
        }

        before - self.active.len()
    }

    /// Check a definition before running it
    pub fn validate_definition(definition: &FlowDefinition) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if definition.steps.is_empty() {
            errors.push("Flow has no steps".to_string());
        }

        let mut seen = HashSet::new();
        for (index, step) in definition.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                errors.push(format!("Step {} has no id", index + 1));
                continue;
            }
            if !seen.insert(step.id.as_str()) {
                errors.push(format!("Duplicate step id '{}'", step.id));
            }
            if is_reserved_prefix(&step.id) {
                errors.push(format!(
                    "Step id '{}' is reserved for variable references",
                    step.id
                ));
            }

            match (&step.method, &step.operation) {
                (None, None) => errors.push(format!(
                    "Step '{}' has neither a method nor an operation reference",
                    step.id
                )),
                (Some(_), None) if step.url.as_deref().map_or(true, |u| u.trim().is_empty()) => {
                    errors.push(format!("Step '{}' has a method but no url", step.id))
                }
                _ => {}
            }

            if let Some(timeout) = step.timeout {
                if timeout < MIN_RECOMMENDED_TIMEOUT_MS {
                    warnings.push(format!(
                        "Step '{}' timeout of {}ms is below {}ms",
                        step.id, timeout, MIN_RECOMMENDED_TIMEOUT_MS
                    ));
                }
            }
        }

        if let Some(config) = &definition.config {
            if let Some(timeout) = config.timeout {
                if timeout < MIN_RECOMMENDED_TIMEOUT_MS {
                    warnings.push(format!(
                        "Flow timeout of {}ms is below {}ms",
                        timeout, MIN_RECOMMENDED_TIMEOUT_MS
                    ));
                }
            }
            if let Some(max) = config.max_concurrency {
                if max > MAX_RECOMMENDED_CONCURRENCY {
                    warnings.push(format!(
                        "maxConcurrency of {} is above {}",
                        max, MAX_RECOMMENDED_CONCURRENCY
                    ));
                }
            }
        }

        let mut inputs = HashSet::new();
        for input in &definition.flow_inputs {
            if !inputs.insert(input.name.as_str()) {
                errors.push(format!("Duplicate input declaration '{}'", input.name));
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{FlowConfig, FlowInput, InputType, Step};

    fn manager() -> FlowStateManager {
        let clock = MockClock::new();
        clock.freeze();
        FlowStateManager::with_clock(clock)
    }

    #[test]
    fn test_lifecycle_to_completed() {
        let mut manager = manager();

        assert_eq!(manager.create("f1", 2).status, FlowStatus::Idle);
        assert_eq!(manager.start("f1", 2).status, FlowStatus::Running);

        manager
            .add_result("f1", StepResult::failed("a", "a", "boom"))
            .unwrap();
        assert_eq!(manager.get("f1").unwrap().current_step, 1);

        manager.clock().forward(Duration::from_millis(250));
        let done = manager.complete("f1", true).unwrap();

        assert_eq!(done.status, FlowStatus::Completed);
        assert_eq!(done.elapsed_ms(Utc::now()), 250);
        assert!(manager.get("f1").is_none());
        assert_eq!(manager.history("f1").len(), 1);
    }

    #[test]
    fn test_complete_requires_running() {
        let mut manager = manager();
        manager.create("f1", 1);
        assert!(matches!(
            manager.complete("f1", true),
            Err(ExecutorError::InvalidState(_))
        ));
        assert!(matches!(
            manager.complete("missing", true),
            Err(ExecutorError::FlowNotFound(_))
        ));
    }

    #[test]
    fn test_restart_clears_results() {
        let mut manager = manager();
        manager.start("f1", 1);
        manager
            .add_result("f1", StepResult::failed("a", "a", "boom"))
            .unwrap();
        manager.add_error("f1", "boom").unwrap();

        let state = manager.start("f1", 3);
        assert!(state.results.is_empty());
        assert!(state.errors.is_empty());
        assert_eq!(state.current_step, 0);
        assert_eq!(state.total_steps, 3);
    }

    #[test]
    fn test_history_keeps_most_recent() {
        let mut manager = manager();
        for run in 0..15 {
            manager.start("f1", run);
            manager.complete("f1", run % 2 == 0).unwrap();
        }

        let history = manager.history("f1");
        assert_eq!(history.len(), 10);
        assert_eq!(history.first().unwrap().total_steps, 5);
        assert_eq!(history.last().unwrap().total_steps, 14);
    }

    #[test]
    fn test_update_with_terminal_status() {
        let mut manager = manager();
        manager.start("f1", 1);
        manager
            .update(
                "f1",
                FlowStateUpdate {
                    status: Some(FlowStatus::Stopped),
                    current_step: Some(1),
                    ..FlowStateUpdate::default()
                },
            )
            .unwrap();

        assert!(manager.get("f1").is_none());
        let last = manager.history("f1").pop().unwrap();
        assert_eq!(last.status, FlowStatus::Stopped);
        assert_eq!(last.current_step, 1);
    }

    #[test]
    fn test_statistics() {
        let mut manager = manager();
        manager.start("a", 1);
        manager.complete("a", true).unwrap();
        manager.start("b", 1);
        manager.complete("b", false).unwrap();
        manager.start("c", 1);
        manager.stop("c").unwrap();
        manager.start("d", 1);
        manager.create("e", 1);

        let stats = manager.statistics();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.stopped, 1);
        assert_eq!(stats.total_executions, 3);
    }

    #[test]
    fn test_cleanup_discards_stale_records() {
        let mut manager = manager().with_max_age(Duration::from_secs(3600));
        manager.start("old", 1);
        manager.clock().forward(Duration::from_secs(2 * 3600));
        manager.start("fresh", 1);

        assert_eq!(manager.cleanup(), 1);
        assert!(manager.get("old").is_none());
        assert!(manager.get("fresh").is_some());
        assert!(manager.history("old").is_empty());
    }

    #[test]
    fn test_export_import() {
        let mut manager = manager();
        manager.start("f1", 2);
        manager.clock().forward(Duration::from_millis(40));

        let exported = manager.export("f1").unwrap();
        assert_eq!(exported["status"], "running");
        assert_eq!(exported["elapsedMs"], 40);

        let mut other = FlowStateManager::new();
        assert_eq!(other.import(exported).unwrap(), "f1");
        assert_eq!(other.get("f1").unwrap().total_steps, 2);

        assert!(other.import(serde_json::json!({ "flowId": 3 })).is_err());
    }

    #[test]
    fn test_validate_definition() {
        let definition = FlowDefinition::new(vec![
            Step::new("a", "GET", "http://h/a").with_timeout(500),
            Step::new("a", "GET", "http://h/b"),
            Step::new("c", "GET", ""),
            Step {
                id: "d".to_string(),
                ..Step::default()
            },
            Step::operation("e", "list-users"),
        ])
        .with_config(FlowConfig {
            max_concurrency: Some(50),
            ..FlowConfig::default()
        })
        .with_input(FlowInput::new("base", InputType::String))
        .with_input(FlowInput::new("base", InputType::String));

        let report = FlowStateManager::validate_definition(&definition);
        assert!(!report.valid);
        assert_eq!(
            report.errors,
            vec![
                "Duplicate step id 'a'".to_string(),
                "Step 'c' has a method but no url".to_string(),
                "Step 'd' has neither a method nor an operation reference".to_string(),
                "Duplicate input declaration 'base'".to_string(),
            ]
        );
        assert_eq!(report.warnings.len(), 2);

        let empty = FlowStateManager::validate_definition(&FlowDefinition::new(vec![]));
        assert_eq!(empty.errors, vec!["Flow has no steps".to_string()]);
    }

    #[test]
    fn test_validate_rejects_scope_names_as_step_ids() {
        let definition = FlowDefinition::new(vec![
            Step::new("config", "GET", "http://h/a"),
            Step::new("header", "GET", "http://h/b"),
            Step::new("login", "GET", "http://h/c"),
        ]);

        let report = FlowStateManager::validate_definition(&definition);
        assert!(!report.valid);
        assert_eq!(
            report.errors,
            vec![
                "Step id 'config' is reserved for variable references".to_string(),
                "Step id 'header' is reserved for variable references".to_string(),
            ]
        );
    }
}
