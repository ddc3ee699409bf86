//! Progressive Loader - command line front end
//!
//! ```text
//! progressive-loader plan <frame-count>
//! progressive-loader load [--transfer-syntax=<uid>] <uri>...
//! ```
//!
//! `plan` prints the resolved retrieve plan as JSON. `load` fetches every
//! frame URI through the configured stages and logs each refinement as it
//! is delivered.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with LOADER__)

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use progressive_loader::config::LoggingConfig;
use progressive_loader::prelude::*;
use progressive_loader::StageResolver;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const TRANSFER_SYNTAX_FLAG: &str = "--transfer-syntax=";

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    init_logging(&config.logging)?;

    info!(
        service = "progressive-loader",
        version = env!("CARGO_PKG_VERSION"),
        stages = config.retrieve.stages.len(),
        "Starting progressive loader"
    );

    config.validate()?;

    if config.metrics.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics.port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(%addr, "Prometheus exporter listening");
    }

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("plan") => {
            let frame_count: usize = args
                .get(2)
                .context("plan requires a frame count")?
                .parse()
                .context("frame count must be a non-negative integer")?;
            run_plan(&config, frame_count)?;
        }
        Some("load") if args.len() > 2 => run_load(&config, &args[2..]).await?,
        _ => print_usage(),
    }

    Ok(())
}

/// Load configuration, falling back to the environment alone.
fn load_config() -> Result<LoaderConfig> {
    let config = LoaderConfig::load().or_else(|e| {
        eprintln!("Failed to load config from files ({e}), trying environment");
        LoaderConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("progressive_loader={}", level).parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    }

    Ok(())
}

/// Print the resolved plan for `frame_count` frames.
fn run_plan(config: &LoaderConfig, frame_count: usize) -> Result<()> {
    let plans = StageResolver::resolve(&config.retrieve, frame_count);
    let json = serde_json::to_string_pretty(&plans).context("Failed to serialize plan")?;
    println!("{json}");
    Ok(())
}

/// Load every URI and log each delivered refinement.
async fn run_load(config: &LoaderConfig, args: &[String]) -> Result<()> {
    let transfer_syntax = args
        .iter()
        .find_map(|arg| arg.strip_prefix(TRANSFER_SYNTAX_FLAG))
        .map(str::to_string);

    let frames: Vec<FrameTarget> = args
        .iter()
        .filter(|arg| !arg.starts_with(TRANSFER_SYNTAX_FLAG))
        .enumerate()
        .map(|(index, uri)| FrameTarget::new(format!("frame-{}", index + 1), uri.as_str()))
        .collect();

    let loader = ProgressiveLoader::from_config(config).context("Failed to create loader")?;

    let mut request = LoadRequest::new(frames).with_configuration(config.retrieve.clone());
    request.transfer_syntax_uid = transfer_syntax;

    let session = Arc::new(LoadSession::new());
    let handle = loader.load(request, session.clone());

    let sink = Arc::new(LoggingSink::new());
    let consumers: Vec<_> = handle
        .frames
        .iter()
        .cloned()
        .map(|channel| {
            let sink = sink.clone();
            tokio::spawn(async move { consume(&channel, sink.as_ref()).await })
        })
        .collect();

    tokio::select! {
        _ = shutdown_signal() => {
            warn!(session_id = %session.id(), "Received shutdown signal, purging load");
            session.purge();
        }
        summary = handle.finished() => {
            if let Some(summary) = summary {
                info!(
                    stages = summary.stages_completed,
                    delivered = summary.frames_delivered,
                    failed = summary.frames_failed,
                    cancelled = summary.cancelled,
                    "Load finished"
                );
            }
        }
    }

    for consumer in consumers {
        match consumer.await? {
            Ok(delivered) => info!(delivered, "Frame stream complete"),
            Err(e) => error!(error = %e, "Frame stream failed"),
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

fn print_usage() {
    println!("Usage: progressive-loader [plan <frame-count>|load [--transfer-syntax=<uid>] <uri>...]");
    println!();
    println!("Modes:");
    println!("  plan - Print the resolved retrieve plan as JSON");
    println!("  load - Fetch frames through every stage and log each refinement");
    println!();
    println!("Environment variables:");
    println!("  RUN_MODE                        - Selects config/{{RUN_MODE}}.toml (default: development)");
    println!("  LOADER__HTTP__MAX_RETRIES       - Retries of transient failures (default: 3)");
    println!("  LOADER__HTTP__REQUEST_TIMEOUT_SECS - Request timeout (default: 30)");
    println!("  LOADER__LOGGING__FORMAT         - json or pretty (default: json)");
    println!("  LOADER__METRICS__ENABLED        - Serve Prometheus metrics (default: false)");
}
