//! Step Runner - Executes flow steps and threads outputs between them
//!
//! This is the main engine that:
//! 1. Builds each step's concrete request from the current variable pool
//! 2. Validates and dispatches it through the injected transport
//! 3. Applies the stop-on-error policy at step and batch boundaries
//! 4. Projects each response back into the pool for later steps
//!
//! Sequential mode runs steps strictly in order. Parallel mode runs
//! order-preserving batches of `min(max_concurrency, steps)` one after another;
//! steps inside a batch run concurrently against the pool as it was when the
//! batch started, so they never see each other's outputs.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::bridge::{HttpTransport, TransportRequest};
use crate::engine::error::ExecutorError;
use crate::engine::result::{ResolvedRequest, ResponseSummary, RunResult, StepResult};
use crate::workflow::expressions::{interpolate_value, navigate, resolve, resolve_json_text};
use crate::workflow::{FlowConfig, Operation, Step, VariablePool};

pub const DEFAULT_TIMEOUT_MS: u64 = 30000;
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

const HTTP_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// How steps are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
        }
    }
}

/// Options for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunOptions {
    pub mode: ExecutionMode,

    /// Timeout for steps that do not set their own, in milliseconds
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,

    pub stop_on_error: bool,

    /// Batch size in parallel mode
    pub max_concurrency: usize,

    /// Build requests without sending them
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            stop_on_error: true,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            dry_run: false,
        }
    }
}

impl RunOptions {
    /// Options declared by a flow's config block, defaults elsewhere
    pub fn from_flow_config(config: Option<&FlowConfig>) -> Self {
        let mut options = Self::default();
        if let Some(config) = config {
            if let Some(timeout) = config.timeout {
                options.timeout_ms = timeout;
            }
            if let Some(stop) = config.stop_on_error {
                options.stop_on_error = stop;
            }
            if let Some(max) = config.max_concurrency {
                options.max_concurrency = max;
            }
            if config.parallel {
                options.mode = ExecutionMode::Parallel;
            }
        }
        options
    }

    pub fn parallel(mut self, max_concurrency: usize) -> Self {
        self.mode = ExecutionMode::Parallel;
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn stop_on_error(mut self, enabled: bool) -> Self {
        self.stop_on_error = enabled;
        self
    }

    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Steps per batch for a run of `step_count` steps
    pub fn batch_size(&self, step_count: usize) -> usize {
        self.max_concurrency.max(1).min(step_count.max(1))
    }

    /// Number of batches parallel mode uses for `step_count` steps
    pub fn batch_count(&self, step_count: usize) -> usize {
        if step_count == 0 {
            return 0;
        }
        step_count.div_ceil(self.batch_size(step_count))
    }
}

/// Per-run state, owned by the runner for the duration of one run
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub variables: VariablePool,
    pub options: RunOptions,
    pub results: Vec<StepResult>,
    pub errors: Vec<String>,
    pub stopped: bool,
}

impl ExecutionContext {
    pub fn new(mut variables: VariablePool, options: RunOptions) -> Self {
        variables.set_config("timeout", options.timeout_ms);
        variables.set_config("stopOnError", options.stop_on_error);
        variables.set_config("maxConcurrency", options.max_concurrency as u64);
        variables.set_config("mode", options.mode.as_str());
        variables.set_config("dryRun", options.dry_run);

        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            variables,
            options,
            results: Vec::new(),
            errors: Vec::new(),
            stopped: false,
        }
    }

    /// Record a settled step. Returns true when the run must stop.
    fn record(&mut self, step: &Step, result: StepResult) -> bool {
        let failed = !result.success;

        if failed {
            let message = format!(
                "Step '{}' failed: {}",
                step.display_name(),
                result.error.as_deref().unwrap_or("unknown error")
            );
            warn!("{}", message);
            self.errors.push(message);
        }

        if !failed || !self.options.stop_on_error {
            project_outputs(&mut self.variables, step, &result);
        }

        self.results.push(result);

        if failed && self.options.stop_on_error {
            self.stopped = true;
        }
        self.stopped
    }
}

/// Write a step's response into the pool: the step output object under the
/// step id, the flat `step_<id>_*` runtime entries, and any extracted values.
pub fn project_outputs(pool: &mut VariablePool, step: &Step, result: &StepResult) {
    let Some(response) = &result.response else {
        return;
    };

    let mut output = json!({
        "status": response.status,
        "time": response.elapsed_ms,
        "success": result.success,
        "response": response.body,
        "headers": response.headers,
    });

    let mut extracted = Vec::new();
    for (name, path) in &step.extract {
        let segments: Vec<&str> = path.split('.').collect();
        match navigate(&output, &segments, path) {
            Ok(value) => extracted.push((name.clone(), value.clone())),
            Err(e) => debug!("Extraction '{}' on step '{}' skipped: {}", name, step.id, e),
        }
    }

    pool.set_runtime(&format!("step_{}_response", step.id), response.body.clone());
    pool.set_runtime(&format!("step_{}_status", step.id), response.status);
    pool.set_runtime(&format!("step_{}_time", step.id), response.elapsed_ms);

    for (name, value) in extracted {
        pool.set_runtime(&format!("step_{}_{}", step.id, name), value.clone());
        if let Value::Object(map) = &mut output {
            map.insert(name, value);
        }
    }

    pool.set_step_output(&step.id, output);
}

/// Interpolate a body. Structured bodies are serialized, interpolated as text
/// with JSON-escaped values and parsed back; if the text no longer parses,
/// each string field is interpolated in place instead.
fn resolve_body(body: &Value, pool: &VariablePool) -> Value {
    match body {
        Value::String(text) => Value::String(resolve(text, pool)),
        Value::Object(_) | Value::Array(_) => serde_json::to_string(body)
            .ok()
            .and_then(|text| serde_json::from_str(&resolve_json_text(&text, pool)).ok())
            .unwrap_or_else(|| interpolate_value(body, pool)),
        other => other.clone(),
    }
}

/// Check a resolved request before it is sent
pub fn validate_request(request: &ResolvedRequest) -> Result<(), String> {
    if !HTTP_METHODS.contains(&request.method.as_str()) {
        return Err(format!("unsupported HTTP method '{}'", request.method));
    }

    let url = request.url.trim();
    if url.is_empty() {
        return Err("URL is empty".to_string());
    }

    // Relative paths are left for a transport configured with a base URL
    if url.starts_with('/') && !url.starts_with("//") {
        if url.chars().any(char::is_whitespace) {
            return Err(format!("invalid URL '{}'", request.url));
        }
        return Ok(());
    }

    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => Ok(()),
        Ok(parsed) => Err(format!(
            "invalid URL '{}': unsupported scheme '{}' or missing host",
            request.url,
            parsed.scheme()
        )),
        Err(e) => Err(format!("invalid URL '{}': {}", request.url, e)),
    }
}

/// Runs steps against an injected transport
#[derive(Clone)]
pub struct StepRunner {
    transport: Arc<dyn HttpTransport>,
    operations: Arc<HashMap<String, Operation>>,
}

impl StepRunner {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            operations: Arc::new(HashMap::new()),
        }
    }

    /// Register the pre-defined operations steps may reference
    pub fn with_operations(mut self, operations: HashMap<String, Operation>) -> Self {
        self.operations = Arc::new(operations);
        self
    }

    pub fn operation(&self, id: &str) -> Option<&Operation> {
        self.operations.get(id)
    }

    /// Run steps and return per-step results plus the final variable pool.
    /// Per-step failures are recorded in the results; only an unexpected
    /// run-level failure is reported through `errors` without a step result.
    #[instrument(skip_all, fields(steps = steps.len(), mode = options.mode.as_str()))]
    pub async fn run(&self, steps: &[Step], variables: VariablePool, options: &RunOptions) -> RunResult {
        let started = Instant::now();
        let mut ctx = ExecutionContext::new(variables, options.clone());
        info!("Starting run {} ({} steps)", ctx.run_id, steps.len());

        let outcome = match options.mode {
            ExecutionMode::Sequential => self.run_sequential(steps, &mut ctx).await,
            ExecutionMode::Parallel => self.run_parallel(steps, &mut ctx).await,
        };

        if let Err(e) = outcome {
            error!("Run {} aborted: {}", ctx.run_id, e);
            ctx.errors.push(e.to_string());
            ctx.stopped = true;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let success = ctx.errors.is_empty();
        info!(
            "Run {} finished: success={} results={} errors={} ({}ms)",
            ctx.run_id,
            success,
            ctx.results.len(),
            ctx.errors.len(),
            elapsed_ms
        );

        RunResult {
            success,
            results: ctx.results,
            elapsed_ms,
            errors: ctx.errors,
            variables: ctx.variables,
            run_id: ctx.run_id,
        }
    }

    async fn run_sequential(
        &self,
        steps: &[Step],
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutorError> {
        let timeout = ctx.options.timeout_ms;
        let dry_run = ctx.options.dry_run;

        for step in steps {
            let result = self.execute_step(step, &ctx.variables, timeout, dry_run).await;
            if ctx.record(step, result) {
                info!("Stopping after failed step '{}'", step.display_name());
                break;
            }
        }

        Ok(())
    }

    async fn run_parallel(
        &self,
        steps: &[Step],
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutorError> {
        if steps.is_empty() {
            return Ok(());
        }

        let batch_size = ctx.options.batch_size(steps.len());
        let timeout = ctx.options.timeout_ms;
        let dry_run = ctx.options.dry_run;

        for (index, batch) in steps.chunks(batch_size).enumerate() {
            debug!("Dispatching batch {} ({} steps)", index + 1, batch.len());
            let snapshot = Arc::new(ctx.variables.clone());

            let handles: Vec<_> = batch
                .iter()
                .map(|step| {
                    let runner = self.clone();
                    let step = step.clone();
                    let pool = Arc::clone(&snapshot);
                    tokio::spawn(async move {
                        runner.execute_step(&step, &pool, timeout, dry_run).await
                    })
                })
                .collect();

            // Barrier: every step of the batch settles before any is evaluated
            let outcomes = join_all(handles).await;

            for (step, outcome) in batch.iter().zip(outcomes) {
                let result = outcome.map_err(|e| {
                    ExecutorError::TaskFailed(format!("step '{}': {}", step.id, e))
                })?;
                if ctx.record(step, result) {
                    info!(
                        "Stopping in batch {} after failed step '{}'",
                        index + 1,
                        step.display_name()
                    );
                    break;
                }
            }

            if ctx.stopped {
                break;
            }
        }

        Ok(())
    }

    /// Build the concrete request for a step from the current pool
    pub fn build_request(
        &self,
        step: &Step,
        pool: &VariablePool,
        default_timeout: u64,
    ) -> Result<ResolvedRequest, String> {
        let operation = match &step.operation {
            Some(op_id) => Some(
                self.operations
                    .get(op_id)
                    .ok_or_else(|| format!("unknown operation '{}'", op_id))?,
            ),
            None => None,
        };

        let method = step
            .method
            .clone()
            .or_else(|| operation.map(|op| op.method.clone()))
            .ok_or_else(|| "step has neither a method nor an operation reference".to_string())?;

        let url = step
            .url
            .clone()
            .or_else(|| operation.map(|op| op.url.clone()))
            .unwrap_or_default();

        let mut headers: HashMap<String, String> =
            operation.map(|op| op.headers.clone()).unwrap_or_default();
        headers.extend(step.headers.clone());

        let body = step
            .body
            .as_ref()
            .or_else(|| operation.and_then(|op| op.body.as_ref()));

        Ok(ResolvedRequest {
            method: method.trim().to_uppercase(),
            url: resolve(&url, pool),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k, resolve(&v, pool)))
                .collect(),
            body: body.map(|b| resolve_body(b, pool)),
            timeout_ms: step.timeout.unwrap_or(default_timeout),
        })
    }

    /// Execute one step. Never fails: every failure becomes a failed result.
    #[instrument(skip(self, step, pool), fields(step_id = %step.id))]
    pub async fn execute_step(
        &self,
        step: &Step,
        pool: &VariablePool,
        default_timeout: u64,
        dry_run: bool,
    ) -> StepResult {
        let started = Instant::now();
        let step_name = step.display_name().to_string();

        let request = match self.build_request(step, pool, default_timeout) {
            Ok(request) => request,
            Err(e) => return StepResult::failed(&step.id, &step_name, e),
        };

        if dry_run {
            debug!("Dry run: {} {}", request.method, request.url);
            return StepResult {
                step_id: step.id.clone(),
                step_name,
                success: true,
                elapsed_ms: 0,
                request: Some(request),
                response: None,
                error: None,
            };
        }

        if let Err(e) = validate_request(&request) {
            return StepResult {
                step_id: step.id.clone(),
                step_name,
                success: false,
                elapsed_ms: 0,
                request: Some(request),
                response: None,
                error: Some(format!("Validation failed: {}", e)),
            };
        }

        info!("Executing step '{}': {} {}", step_name, request.method, request.url);

        let transport_request = TransportRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            timeout_ms: request.timeout_ms,
        };

        match self.transport.send(&transport_request).await {
            Ok(response) => {
                let (success, error) = match step.expected_status {
                    Some(expected) if response.status != expected => (
                        false,
                        Some(format!(
                            "Expected status {} but got {}",
                            expected, response.status
                        )),
                    ),
                    Some(_) => (true, None),
                    None if response.success => (true, None),
                    None => (
                        false,
                        Some(
                            response
                                .error
                                .clone()
                                .unwrap_or_else(|| format!("HTTP {}", response.status)),
                        ),
                    ),
                };

                StepResult {
                    step_id: step.id.clone(),
                    step_name,
                    success,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    request: Some(request),
                    response: Some(ResponseSummary {
                        status: response.status,
                        status_text: response.status_text,
                        headers: response.headers,
                        body: response.data,
                        elapsed_ms: response.elapsed_ms,
                        error: response.error,
                    }),
                    error,
                }
            }
            Err(e) => StepResult {
                step_id: step.id.clone(),
                step_name,
                success: false,
                elapsed_ms: started.elapsed().as_millis() as u64,
                request: Some(request),
                response: None,
                error: Some(format!("Request failed: {}", e)),
            },
        }
    }
}
