//! Session Controller - long-lived variable state and tool forwarding
//!
//! A session owns the five variable scopes across invocations, runs flows
//! through the step runner, and forwards tool calls to a protocol server
//! subprocess with the full variable state attached under `__state`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::error::ExecutorError;
use super::executor::{RunOptions, StepRunner};
use super::mock_clock::MockClock;
use super::result::RunResult;
use super::state_manager::{FlowStateManager, FlowStatistics};
use crate::bridge::{BridgeError, HttpTransport, ReqwestTransport, ToolServerBridge};
use crate::workflow::{FlowDefinition, Operation, Scope, SessionConfig, VariablePool};

/// Key under which the variable state is attached to tool arguments
pub const STATE_KEY: &str = "__state";

/// Entry counts per scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeCounts {
    pub flow_inputs: usize,
    pub environment: usize,
    pub runtime: usize,
    pub config: usize,
    pub step_outputs: usize,
}

/// Snapshot returned by `SessionController::info`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub uptime_ms: u64,
    pub variables: ScopeCounts,
    pub server_running: bool,
    pub pending_calls: usize,
    pub flows: FlowStatistics,
}

/// Tool calls, `start`, `info` and `shutdown` take `&self`: a session shared
/// behind an `Arc` can have several calls in flight and still be shut down.
pub struct SessionController {
    id: String,
    created_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    variables: VariablePool,
    config: SessionConfig,
    runner: StepRunner,
    flows: FlowStateManager,
    bridge: Mutex<Option<Arc<ToolServerBridge>>>,
    closed: AtomicBool,
    clock: MockClock,
}

impl SessionController {
    /// Create a session that sends step requests through `transport`
    pub fn new(config: SessionConfig, transport: Arc<dyn HttpTransport>) -> Result<Self, ExecutorError> {
        Self::with_clock(config, transport, MockClock::new())
    }

    /// Create a session using the built-in HTTP transport from `config.web`
    pub fn from_config(config: SessionConfig) -> Result<Self, ExecutorError> {
        let transport = ReqwestTransport::from_config(&config.web)?;
        Self::new(config, Arc::new(transport))
    }

    pub fn with_clock(
        config: SessionConfig,
        transport: Arc<dyn HttpTransport>,
        clock: MockClock,
    ) -> Result<Self, ExecutorError> {
        let max_age = config
            .max_age_duration()
            .map_err(|e| ExecutorError::ConfigError(format!("max_age: {}", e)))?;

        let flows = FlowStateManager::with_clock(clock.clone())
            .with_history_limit(config.history_limit)
            .with_max_age(max_age);

        let mut variables = VariablePool::new();
        variables.merge(Scope::Env, config.environment.clone());

        let now = clock.now();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            last_activity: RwLock::new(now),
            variables,
            config,
            runner: StepRunner::new(transport),
            flows,
            bridge: Mutex::new(None),
            closed: AtomicBool::new(false),
            clock,
        })
    }

    /// Register operations that flow steps may reference
    pub fn with_operations(mut self, operations: HashMap<String, Operation>) -> Self {
        self.runner = self.runner.with_operations(operations);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn variables(&self) -> &VariablePool {
        &self.variables
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn flows(&self) -> &FlowStateManager {
        &self.flows
    }

    fn touch(&self) {
        *self.last_activity.write().unwrap_or_else(PoisonError::into_inner) = self.clock.now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawn the configured protocol server. Does nothing if it is running.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut bridge = self.bridge.lock().await;
        if self.is_closed() {
            return Err(BridgeError::SessionClosed);
        }
        if bridge.is_some() {
            return Ok(());
        }

        let server = self
            .config
            .server
            .as_ref()
            .ok_or_else(|| BridgeError::ConfigError("no server configured".to_string()))?;

        *bridge = Some(Arc::new(ToolServerBridge::start(server).await?));
        info!("Session {} started", self.id);
        self.touch();
        Ok(())
    }

    async fn bridge(&self) -> Result<Arc<ToolServerBridge>, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::SessionClosed);
        }
        self.bridge.lock().await.clone().ok_or(BridgeError::NotRunning)
    }

    /// Per-call timeout: `config.timeout` from the pool, else the session default
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(
            self.variables
                .config_timeout_ms()
                .unwrap_or(self.config.timeout),
        )
    }

    /// Invoke a tool with the variable state attached to its arguments
    #[instrument(skip(self, arguments), fields(session = %self.id))]
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, BridgeError> {
        let mut arguments = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        arguments.insert(STATE_KEY.to_string(), self.variables.snapshot());

        let timeout = self.call_timeout();
        self.touch();
        self.bridge()
            .await?
            .call_tool(name, Value::Object(arguments), timeout)
            .await
    }

    pub async fn list_tools(&self) -> Result<Value, BridgeError> {
        let timeout = self.call_timeout();
        self.touch();
        self.bridge().await?.list_tools(timeout).await
    }

    pub fn set_environment(&mut self, values: Map<String, Value>) {
        self.variables.merge(Scope::Env, values);
        self.touch();
    }

    pub fn set_flow_inputs(&mut self, values: Map<String, Value>) {
        self.variables.merge(Scope::Input, values);
        self.touch();
    }

    pub fn set_step_output(&mut self, step_id: &str, output: Value) {
        self.variables.set_step_output(step_id, output);
        self.touch();
    }

    pub fn set_runtime_variable(&mut self, key: &str, value: Value) {
        self.variables.set_runtime(key, value);
        self.touch();
    }

    pub fn set_config(&mut self, values: Map<String, Value>) {
        self.variables.merge(Scope::Config, values);
        self.touch();
    }

    /// Clear the given scopes
    pub fn reset(&mut self, scopes: &[Scope]) {
        for scope in scopes {
            self.variables.clear(*scope);
        }
        self.touch();
    }

    pub fn reset_all(&mut self) {
        self.reset(&Scope::ALL);
    }

    pub async fn info(&self) -> SessionInfo {
        let bridge = self.bridge.lock().await.clone();
        let (server_running, pending_calls) = match bridge {
            Some(bridge) => (bridge.is_running().await, bridge.pending_count()),
            None => (false, 0),
        };

        SessionInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            uptime_ms: self.clock.millis_since(self.created_at),
            variables: ScopeCounts {
                flow_inputs: self.variables.len(Scope::Input),
                environment: self.variables.len(Scope::Env),
                runtime: self.variables.len(Scope::Runtime),
                config: self.variables.len(Scope::Config),
                step_outputs: self.variables.len(Scope::Steps),
            },
            server_running,
            pending_calls,
            flows: self.flows.statistics(),
        }
    }

    /// Fail pending calls with `SessionClosed` and stop the server. The
    /// session rejects calls afterwards.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        self.closed.store(true, Ordering::SeqCst);
        let Some(bridge) = self.bridge.lock().await.take() else {
            return Ok(());
        };

        info!("Shutting down session {}", self.id);
        bridge
            .shutdown(Duration::from_millis(self.config.shutdown_grace))
            .await
    }

    /// Run options from a flow's config block. Without a flow timeout, steps
    /// default to the session's `config.timeout`, then the configured timeout.
    pub fn options_for(&self, definition: &FlowDefinition) -> RunOptions {
        let mut options = RunOptions::from_flow_config(definition.config.as_ref());
        if definition.config.as_ref().and_then(|c| c.timeout).is_none() {
            options.timeout_ms = self.call_timeout().as_millis() as u64;
        }
        options
    }

    /// Validate and run a flow with options taken from its config block
    pub async fn run_flow(
        &mut self,
        flow_id: &str,
        definition: &FlowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<RunResult, ExecutorError> {
        let options = self.options_for(definition);
        self.run_flow_with_options(flow_id, definition, inputs, &options)
            .await
    }

    /// Validate and run a flow. Definition or input errors are returned
    /// before any step executes. The final variables become the session pool,
    /// except the config scope, which keeps the session's own settings.
    #[instrument(skip(self, definition, inputs, options), fields(session = %self.id))]
    pub async fn run_flow_with_options(
        &mut self,
        flow_id: &str,
        definition: &FlowDefinition,
        inputs: Map<String, Value>,
        options: &RunOptions,
    ) -> Result<RunResult, ExecutorError> {
        let report = FlowStateManager::validate_definition(definition);
        for warning in &report.warnings {
            warn!("Flow '{}': {}", flow_id, warning);
        }
        if !report.valid {
            return Err(ExecutorError::InvalidFlow(report.errors));
        }

        let inputs = definition
            .resolve_inputs(&inputs)
            .map_err(ExecutorError::InvalidFlow)?;

        let mut variables = self.variables.clone();
        variables.merge(Scope::Input, inputs);

        self.flows.start(flow_id, definition.steps.len());
        let result = self.runner.run(&definition.steps, variables, options).await;

        for step in &result.results {
            self.flows.add_result(flow_id, step.clone())?;
        }
        for error in &result.errors {
            self.flows.add_error(flow_id, error.clone())?;
        }
        self.flows.merge_variables(flow_id, &result.variables)?;
        self.flows.complete(flow_id, result.success)?;

        let config = std::mem::take(&mut self.variables.config);
        self.variables = result.variables.clone();
        self.variables.config = config;
        self.touch();
        Ok(result)
    }

    /// Discard stale flow records
    pub fn cleanup_flows(&mut self) -> usize {
        self.flows.cleanup()
    }

    /// Variable state as sent to the server
    pub fn state_snapshot(&self) -> Value {
        json!({ STATE_KEY: self.variables.snapshot() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{TransportRequest, TransportResponse};
    use crate::engine::state_manager::FlowStatus;
    use crate::workflow::{FlowConfig, FlowInput, InputType, Step};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpTransport for CountingTransport {
        async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, BridgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TransportResponse::with_status(200, json!({ "url": request.url })))
        }
    }

    fn session() -> (SessionController, Arc<CountingTransport>) {
        let transport = Arc::new(CountingTransport::default());
        let session = SessionController::new(SessionConfig::default(), transport.clone()).unwrap();
        (session, transport)
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_mutators_and_reset() {
        let (mut session, _) = session();
        session.set_environment(object(json!({ "base": "http://h" })));
        session.set_flow_inputs(object(json!({ "user": "ada" })));
        session.set_runtime_variable("token", json!("t"));
        session.set_config(object(json!({ "timeout": 1500 })));
        session.set_step_output("login", json!({ "status": 200 }));

        assert_eq!(session.call_timeout(), Duration::from_millis(1500));
        assert_eq!(
            session.state_snapshot()["__state"]["environment"]["base"],
            "http://h"
        );

        session.reset(&[Scope::Runtime, Scope::Steps]);
        assert_eq!(session.variables().len(Scope::Runtime), 0);
        assert_eq!(session.variables().len(Scope::Steps), 0);
        assert_eq!(session.variables().len(Scope::Env), 1);

        session.reset_all();
        assert!(session.variables().is_empty());
        assert_eq!(session.call_timeout(), Duration::from_millis(30000));
    }

    #[tokio::test]
    async fn test_info_counts() {
        let (mut session, _) = session();
        session.set_flow_inputs(object(json!({ "a": 1, "b": 2 })));

        let info = session.info().await;
        assert_eq!(info.id, session.id());
        assert_eq!(info.variables.flow_inputs, 2);
        assert!(!info.server_running);
        assert_eq!(info.pending_calls, 0);
    }

    #[tokio::test]
    async fn test_call_tool_requires_server() {
        let (session, _) = session();
        assert!(matches!(
            session.call_tool("echo", json!({})).await,
            Err(BridgeError::NotRunning)
        ));
        assert!(matches!(
            session.start().await,
            Err(BridgeError::ConfigError(_))
        ));

        session.shutdown().await.unwrap();
        assert!(matches!(
            session.call_tool("echo", json!({})).await,
            Err(BridgeError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_flow_runs_nothing() {
        let (mut session, transport) = session();
        let definition = FlowDefinition::new(vec![
            Step::new("a", "GET", "http://h/a"),
            Step::new("a", "GET", "http://h/b"),
        ]);

        let err = session
            .run_flow("f1", &definition, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidFlow(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(session.flows().get("f1").is_none());
    }

    #[tokio::test]
    async fn test_missing_required_input() {
        let (mut session, transport) = session();
        let definition = FlowDefinition::new(vec![Step::new("a", "GET", "{{input.base}}/a")])
            .with_input(FlowInput::new("base", InputType::String).required());

        match session.run_flow("f1", &definition, Map::new()).await {
            Err(ExecutorError::InvalidFlow(errors)) => {
                assert_eq!(errors, vec!["Missing required input 'base'".to_string()])
            }
            other => panic!("unexpected: {:?}", other.map(|r| r.success)),
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_flow_adopts_variables() {
        let (mut session, transport) = session();
        let definition = FlowDefinition::new(vec![
            Step::new("a", "GET", "{{input.base}}/a"),
            Step::new("b", "GET", "{{a.response.url}}/b"),
        ]);

        let result = session
            .run_flow("f1", &definition, object(json!({ "base": "http://h" })))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            result.results[1].request.as_ref().unwrap().url,
            "http://h/a/b"
        );
        assert_eq!(session.variables().runtime["step_b_status"], json!(200));
        assert_eq!(session.variables().input["base"], json!("http://h"));

        let history = session.flows().history("f1");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, FlowStatus::Completed);
        assert_eq!(history[0].current_step, 2);
    }

    #[tokio::test]
    async fn test_run_flow_keeps_session_config() {
        let (mut session, _) = session();
        session.set_config(object(json!({ "timeout": 1500, "retries": 2 })));

        let definition = FlowDefinition::new(vec![Step::new("a", "GET", "http://h/a")]);
        assert_eq!(session.options_for(&definition).timeout_ms, 1500);

        let result = session
            .run_flow("f1", &definition, Map::new())
            .await
            .unwrap();

        assert_eq!(result.results[0].request.as_ref().unwrap().timeout_ms, 1500);
        assert_eq!(result.variables.config["mode"], json!("sequential"));

        assert_eq!(session.call_timeout(), Duration::from_millis(1500));
        assert_eq!(session.variables().config["retries"], json!(2));
        assert!(!session.variables().config.contains_key("mode"));
        assert_eq!(session.variables().runtime["step_a_status"], json!(200));
    }

    #[tokio::test]
    async fn test_flow_timeout_wins_over_session_config() {
        let (mut session, _) = session();
        session.set_config(object(json!({ "timeout": 1500 })));

        let definition = FlowDefinition::new(vec![Step::new("a", "GET", "http://h/a")])
            .with_config(FlowConfig {
                timeout: Some(4000),
                ..Default::default()
            });
        assert_eq!(session.options_for(&definition).timeout_ms, 4000);
    }
}
