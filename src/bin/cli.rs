use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use api_flows::prelude::*;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "otel")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(feature = "otel")]
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "api-flows")]
#[command(about = "Run declarative API test flows", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow file
    Run {
        /// Path to the flow YAML or JSON file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Flow input as key=value (value parsed as JSON when possible)
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// Environment value as key=value
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        envs: Vec<String>,

        /// Run steps in concurrent batches
        #[arg(short, long)]
        parallel: bool,

        /// Batch size for parallel runs (overrides the flow config)
        #[arg(short, long)]
        max_concurrency: Option<usize>,

        /// Build requests without sending them
        #[arg(long)]
        dry_run: bool,

        /// Keep running after a failed step
        #[arg(long)]
        continue_on_error: bool,

        /// Path to session.yaml (default: session.yaml next to FILE, if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the full run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate flow files without running them
    Validate {
        /// Path to a flow file or a directory of flows
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

fn log_filter(verbose: bool) -> &'static str {
    if verbose {
        "api_flows=debug"
    } else {
        "api_flows=info"
    }
}

#[cfg(feature = "otel")]
fn init_otel_tracing(verbose: bool) -> anyhow::Result<()> {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::runtime::Tokio;
    use opentelemetry_sdk::trace::TracerProvider;

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()
        .context("Failed to create OTLP exporter")?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .build();

    let tracer = provider.tracer("api-flows");
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(EnvFilter::new(log_filter(verbose)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(otel_layer)
        .init();

    opentelemetry::global::set_tracer_provider(provider);
    Ok(())
}

#[cfg(not(feature = "otel"))]
fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_filter(verbose)))
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    #[cfg(feature = "otel")]
    let initialized = init_otel_tracing(cli.verbose);

    #[cfg(not(feature = "otel"))]
    let initialized = init_tracing(cli.verbose);

    if let Err(e) = initialized {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(2);
    }

    let result = run(cli).await;

    #[cfg(feature = "otel")]
    opentelemetry::global::shutdown_tracer_provider();

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %e, "api-flows failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    match cli.command {
        Commands::Run {
            file,
            inputs,
            envs,
            parallel,
            max_concurrency,
            dry_run,
            continue_on_error,
            config,
            json,
        } => {
            let overrides = Overrides {
                parallel,
                max_concurrency,
                dry_run,
                continue_on_error,
            };
            run_flow(
                &file,
                parse_pairs(&inputs)?,
                parse_pairs(&envs)?,
                overrides,
                config,
                json,
            )
            .await
        }
        Commands::Validate { path } => validate(&path),
    }
}

struct Overrides {
    parallel: bool,
    max_concurrency: Option<usize>,
    dry_run: bool,
    continue_on_error: bool,
}

impl Overrides {
    fn apply(&self, mut options: RunOptions) -> RunOptions {
        if self.parallel {
            options.mode = ExecutionMode::Parallel;
        }
        if let Some(max) = self.max_concurrency {
            options.max_concurrency = max;
        }
        if self.dry_run {
            options.dry_run = true;
        }
        if self.continue_on_error {
            options.stop_on_error = false;
        }
        options
    }
}

/// Parse `key=value` arguments; values that are valid JSON keep their type
fn parse_pairs(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("expected KEY=VALUE, got '{}'", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.trim().to_string(), value);
    }
    Ok(map)
}

fn session_config(file: &Path, explicit: Option<PathBuf>) -> anyhow::Result<SessionConfig> {
    let path = explicit.or_else(|| {
        let candidate = file.parent()?.join("session.yaml");
        candidate.exists().then_some(candidate)
    });

    match path {
        Some(path) => {
            tracing::info!("Using config: {}", path.display());
            Ok(SessionConfig::load(&path)?)
        }
        None => Ok(SessionConfig::default()),
    }
}

fn flow_id(file: &Path, definition: &FlowDefinition) -> String {
    definition.name.clone().unwrap_or_else(|| {
        file.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("flow")
            .to_string()
    })
}

async fn run_flow(
    file: &Path,
    inputs: Map<String, Value>,
    envs: Map<String, Value>,
    overrides: Overrides,
    config: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<bool> {
    let definition = FlowLoader::load_file(file)?;
    let config = session_config(file, config)?;

    let mut session = SessionController::from_config(config)?;
    session.set_environment(envs);

    let options = overrides.apply(session.options_for(&definition));
    let flow_id = flow_id(file, &definition);

    if !json {
        println!("Running flow: {}", file.display());
    }
    let result = match session
        .run_flow_with_options(&flow_id, &definition, inputs, &options)
        .await
    {
        Ok(result) => result,
        Err(ExecutorError::InvalidFlow(errors)) => {
            eprintln!("✗ {}: invalid flow", flow_id);
            for error in &errors {
                eprintln!("      Error: {}", error);
            }
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_run_result(&result);
    }

    Ok(result.success)
}

fn validate(path: &Path) -> anyhow::Result<bool> {
    if !path.exists() {
        anyhow::bail!("Path not found: {}", path.display());
    }

    let flows = if path.is_dir() {
        FlowLoader::load_directory(path)?
    } else {
        let definition = FlowLoader::load_file(path)?;
        vec![(flow_id(path, &definition), definition)]
    };

    if flows.is_empty() {
        println!("No flows found in: {}", path.display());
        return Ok(true);
    }

    let mut all_valid = true;
    for (name, definition) in &flows {
        let report = FlowStateManager::validate_definition(definition);
        let status = if report.valid { "✓" } else { "✗" };
        println!("{} {}", status, name);
        for error in &report.errors {
            println!("      Error: {}", error);
        }
        for warning in &report.warnings {
            println!("      Warning: {}", warning);
        }
        all_valid &= report.valid;
    }

    Ok(all_valid)
}

fn print_run_result(result: &RunResult) {
    println!("\n=== Flow Result ===\n");
    println!("Success: {}", if result.success { "YES" } else { "NO" });
    println!("Run ID: {}", result.run_id);
    println!("Elapsed: {}ms\n", result.elapsed_ms);

    for step in &result.results {
        let status = if step.success { "✓" } else { "✗" };
        let observed = step
            .response
            .as_ref()
            .map(|r| format!(" -> {}", r.status))
            .unwrap_or_default();
        let target = step
            .request
            .as_ref()
            .map(|r| format!(" {} {}", r.method, r.url))
            .unwrap_or_default();
        println!("  {} {}{}{}", status, step.step_name, target, observed);
        if let Some(err) = &step.error {
            println!("      Error: {}", err);
        }
    }

    let step_errors = result.results.iter().filter(|r| !r.success).count();
    if result.errors.len() > step_errors {
        println!("\nRun errors:");
        for error in &result.errors[step_errors..] {
            println!("  {}", error);
        }
    }
}
