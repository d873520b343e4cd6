//! Scriptbox - CLI entry point
//!
//! Command-line interface for running untrusted JavaScript snippets in
//! isolated worker processes, and the entry point those workers run.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use scriptbox::api::handle_request;
use scriptbox::config::EngineConfig;
use scriptbox::sandbox::allowlist::{GLOBAL_ALLOWLIST, HOST_BINDINGS};
use scriptbox::sandbox::engine::{ExecutionEngine, ExecutionRequest};
use scriptbox::sandbox::worker::run_worker;

/// Scriptbox - Run untrusted JavaScript in a sandbox
///
/// Each program runs in a fresh realm inside its own worker process, with
/// only pure language builtins, a captured console and realm-scoped timers.
///
/// # Examples
///
/// Run a script file:
///     scriptbox exec script.js
///
/// Run from stdin with a 1 second deadline:
///     echo "console.log(1)" | scriptbox exec --timeout-ms 1000
///
/// Handle a JSON request body:
///     echo '{"code": "40 + 2"}' | scriptbox request
#[derive(Parser, Debug)]
#[command(name = "scriptbox")]
#[command(about = "Scriptbox - Run untrusted JavaScript in a sandbox")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to settings JSON file
    ///
    /// If provided, loads engine configuration (limits and worker settings)
    /// from this JSON file. Fields left out keep their defaults.
    #[arg(long, short = 's', global = true)]
    settings: Option<PathBuf>,

    /// Enable debug logging
    ///
    /// When enabled, prints worker lifecycle events, deadlines and
    /// admission decisions to stderr.
    #[arg(long, short = 'd', global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Run a script file, or stdin when no file is given
    Exec {
        /// Script to run; `-` or nothing reads stdin
        file: Option<PathBuf>,

        /// Execution deadline in milliseconds, clamped to the configured maximum
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the JSON response body instead of plain output
        #[arg(long)]
        json: bool,
    },

    /// Handle one JSON request body read from stdin
    Request,

    /// Print the globals a script can reach
    Allowlist,

    /// Worker process entry point
    #[command(hide = true)]
    Worker,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Workers speak the protocol on stdout and need no async runtime
    if cli.command == Command::Worker {
        initialize_logging("warn")?;
        return run_worker(std::io::stdin().lock(), std::io::stdout().lock());
    }

    initialize_logging(if cli.debug { "debug" } else { "info" })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let code = runtime.block_on(run(cli))?;
    drop(runtime);

    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Exec {
            file,
            timeout_ms,
            json,
        } => {
            let config = load_config(cli.settings.as_deref())?;
            exec(config, file.as_deref(), timeout_ms, json).await
        }
        Command::Request => {
            let config = load_config(cli.settings.as_deref())?;
            request(config).await
        }
        Command::Allowlist => {
            let listing = json!({
                "globals": GLOBAL_ALLOWLIST,
                "host_bindings": HOST_BINDINGS,
            });
            println!("{}", serde_json::to_string_pretty(&listing)?);
            Ok(0)
        }
        Command::Worker => Ok(0),
    }
}

/// Loads configuration from file or uses defaults.
fn load_config(settings: Option<&Path>) -> Result<EngineConfig> {
    let config = if let Some(settings_path) = settings {
        tracing::info!("Loading configuration from: {}", settings_path.display());
        EngineConfig::from_file(settings_path)?
    } else {
        tracing::debug!("Using default engine configuration");
        EngineConfig::default()
    };

    config.validate()?;
    Ok(config)
}

async fn exec(
    config: EngineConfig,
    file: Option<&Path>,
    timeout_ms: Option<u64>,
    json: bool,
) -> Result<i32> {
    let source = match file {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script: {}", path.display()))?,
        _ => read_stdin()?,
    };

    let engine = ExecutionEngine::new(config)?;
    let mut request = ExecutionRequest::new(source);
    if let Some(ms) = timeout_ms {
        request = request.with_deadline(Duration::from_millis(ms));
    }

    let result = engine.execute(request).await?;

    if json {
        println!("{}", result.to_json_string()?);
    } else {
        if !result.output.is_empty() {
            println!("{}", result.output);
        }
        if let Some(error) = &result.error {
            eprintln!("{}", error);
        }
    }

    Ok(if result.is_success() { 0 } else { 1 })
}

async fn request(config: EngineConfig) -> Result<i32> {
    let body = read_stdin()?;
    let engine = ExecutionEngine::new(config)?;

    let response = handle_request(&engine, body.as_bytes()).await;
    println!("{}", response.body_json());
    eprintln!("status: {}", response.status);

    Ok(exit_code_for_status(response.status))
}

fn exit_code_for_status(status: u16) -> i32 {
    match status {
        200..=299 => 0,
        400..=499 => 2,
        _ => 3,
    }
}

fn read_stdin() -> Result<String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read stdin")?;
    Ok(input)
}

/// Initializes the logging system.
///
/// Sets up a tracing subscriber writing to stderr at `level`, unless
/// `RUST_LOG` asks for something else.
///
/// # Errors
///
/// Returns an error if the logging subscriber fails to initialize.
fn initialize_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    Ok(())
}
