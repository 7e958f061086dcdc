//! The `taskweave` binary: resolve configuration, probe the inference
//! backend, and run the HTTP front-end until interrupted.
//!
//! Exit codes: `0` clean shutdown, `1` fatal init error (bad config, or
//! backend unreachable with `--strict`), `2` bind error, `130` interrupted
//! by signal.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use taskweave::config::{CliOverrides, EngineConfig};
use taskweave::inference::LocalInferenceClient;
use taskweave::orchestrator::Environment;
use taskweave::server::{self, AppState};

#[derive(Parser, Debug)]
#[command(name = "taskweave", version, about = "Task-orchestration engine for locally-hosted LLM agents")]
struct Cli {
    /// Base URL of the local inference endpoint.
    #[arg(long)]
    inference_host: Option<String>,

    /// Interface to bind the HTTP front-end to.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind the HTTP front-end to.
    #[arg(long)]
    port: Option<u16>,

    /// Data directory (personas, workflow memory, sessions).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter (error, warn, info, debug, trace).
    #[arg(long)]
    log_level: Option<String>,

    /// Fail startup when the inference backend is unreachable.
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let overrides = CliOverrides {
        inference_host: cli.inference_host,
        http_host: cli.host,
        http_port: cli.port,
        log_level: cli.log_level,
        data_dir: cli.data_dir,
        config_file: cli.config,
        strict: cli.strict,
    };

    let config = match EngineConfig::resolve(&overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("taskweave: {}", e);
            return ExitCode::from(1);
        }
    };

    env_logger::Builder::new()
        .parse_filters(&config.log_level)
        .init();

    let inference = Arc::new(LocalInferenceClient::new(config.inference_host.clone()));
    match inference.refresh_models().await {
        Ok(models) => log::info!("inference backend up, {} models installed", models.len()),
        Err(e) => {
            if config.strict_startup {
                log::error!("inference backend unreachable in strict mode: {}", e);
                return ExitCode::from(1);
            }
            log::warn!("inference backend not reachable yet: {}", e);
        }
    }

    let env = match Environment::new(config.clone(), inference) {
        Ok(env) => Arc::new(env),
        Err(e) => {
            log::error!("initialisation failed: {}", e);
            return ExitCode::from(1);
        }
    };
    let state = AppState::new(env);

    let listener = match server::bind(&config.http_host, config.http_port).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!(
                "cannot bind {}:{}: {}",
                config.http_host,
                config.http_port,
                e
            );
            return ExitCode::from(2);
        }
    };
    log::info!(
        "taskweave listening on {}:{} (backend {})",
        config.http_host,
        config.http_port,
        config.inference_host
    );

    let (interrupted_tx, mut interrupted_rx) = tokio::sync::watch::channel(false);
    let shutdown = async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = interrupted_tx.send(true);
        }
    };

    if let Err(e) = server::serve(listener, state, shutdown).await {
        log::error!("server error: {}", e);
        return ExitCode::from(1);
    }

    if *interrupted_rx.borrow_and_update() {
        log::info!("interrupted, shutting down");
        return ExitCode::from(130);
    }
    ExitCode::from(0)
}
