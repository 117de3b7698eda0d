use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use reelgen_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use reelgen_core::handler::Handler;
use reelgen_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RuntimeLogMode,
    DEFAULT_LOG_FILTER,
};
use reelgen_core::onnx_model::OnnxModelLoader;
use reelgen_core::server::worker_router;

#[derive(Parser)]
#[command(
    name = "reelgen",
    about = "Serverless worker turning a prompt or an image into a short vertical video",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle one event and print the response JSON on stdout.
    Handle(HandleArgs),
}

#[derive(Args)]
struct HandleArgs {
    #[arg(help = "Path to the event JSON file (reads stdin when omitted or '-')")]
    event: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Handle
    } else {
        RuntimeLogMode::Worker
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    reelgen_core::runtime::setup_runtime_libs();
    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    reelgen_core::runtime::log_runtime_lib_status();
    log_startup_metadata(mode, &resolved_data_dir);

    let config = load_config(&resolved_data_dir, mode)?;
    match cli.command {
        Some(Commands::Handle(args)) => handle_once(config, args.event).await,
        None => run_server(config, cli.port, cli.host).await,
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        noise_filter: noise_base.to_string(),
        ..Default::default()
    };

    logging::select_log_filter(&options)
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: panic crash artifact hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be persisted to crash logs."
        );
    }

    let init_options = LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::payload_eliding_make_writer(ready.appender))
                        .with_filter(parse_env_filter_with_fallback(&file_filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = mode.as_str(),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Only the worker seeds a default `config.toml`; `handle` never writes.
fn load_config(data_dir: &Path, mode: RuntimeLogMode) -> Result<AppConfig> {
    if mode == RuntimeLogMode::Worker {
        if let Err(e) = initialize_data_dir(data_dir) {
            warn!(error = %format!("{e:#}"), "Failed to initialize data directory");
        }
    }
    let mut config = AppConfig::load_from_path(&config_path(data_dir))?;
    config.apply_env_overrides();
    config.resolve_paths(data_dir);
    Ok(config)
}

fn build_handler(config: &AppConfig) -> Result<Handler<OnnxModelLoader>> {
    let handler = Handler::from_app_config(config, OnnxModelLoader::from_settings(&config.model))?;
    let generation = handler.config();
    info!(
        fps = generation.fps(),
        duration_s = generation.duration_s(),
        num_frames = generation.num_frames(),
        resolution = %generation.resolution(),
        model = %config.model.path.display(),
        backend = %config.model.backend,
        encoder = %config.encoder.program,
        "Handler configured"
    );
    Ok(handler)
}

async fn run_server(config: AppConfig, port: Option<u16>, host: Option<String>) -> Result<()> {
    let handler = Arc::new(build_handler(&config)?);

    let port = port
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host.unwrap_or_else(|| config.server.host.clone());

    let app = worker_router(handler, config.server.max_body_bytes);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting reelgen worker");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_once(config: AppConfig, event_path: Option<PathBuf>) -> Result<()> {
    let handler = build_handler(&config)?;
    let event = read_event(event_path.as_deref())?;

    let outcome = tokio::task::spawn_blocking(move || handler.handle(&event))
        .await
        .context("handler task panicked")?;

    match outcome {
        Ok(response) => {
            println!("{}", serde_json::to_string(&response)?);
            Ok(())
        }
        Err(error) => {
            println!("{}", json!({"error": error.to_string(), "kind": error.kind()}));
            bail!("request failed ({})", error.kind())
        }
    }
}

fn read_event(path: Option<&Path>) -> Result<Value> {
    let raw = match path {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read event file {}", path.display()))?,
        _ => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("failed to read event from stdin")?;
            raw
        }
    };
    parse_event(&raw)
}

/// Blank input is the empty event, i.e. a healthcheck.
fn parse_event(raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(raw).context("event is not valid JSON")
}
