use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, Level};

use skeefree_server::config::Config;
use skeefree_server::http::router;
use skeefree_server::ops::{continuous_elections, continuous_operations};
use skeefree_server::worker::run_command;
use skeefree_server::AppState;

/// skeefree: automated schema migration orchestration over pull requests
#[derive(Parser, Debug)]
#[command(name = "skeefree")]
#[command(about = "Automated MySQL schema migration orchestration over pull requests", long_about = None)]
struct Cli {
    /// Command for CLI execution (empty to run as service)
    #[arg(short = 'c', long = "command", default_value = "")]
    command: String,

    /// Migration token
    #[arg(long, default_value = "")]
    token: String,

    /// Immediately quit with exit code 0
    #[arg(long = "self-test")]
    self_test: bool,

    /// HTTP address, overrides the HTTP_ADDR environment variable
    #[arg(long, default_value = "")]
    http_addr: String,

    /// Internal address, overrides the INTERNAL_ADDR environment variable
    #[arg(long, default_value = "")]
    internal_addr: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.self_test {
        return ExitCode::SUCCESS;
    }

    let cli_mode = !cli.command.is_empty();
    if cli_mode {
        // Keep stdout clean: it carries the JSON envelope for the worker.
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().with_max_level(Level::INFO).init();
    }

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load configuration from environment");
            return ExitCode::FAILURE;
        }
    };
    if !cli.http_addr.is_empty() {
        config.http_addr = cli.http_addr.clone();
    }
    if !cli.internal_addr.is_empty() {
        config.internal_addr = Some(cli.internal_addr.clone());
    }

    let result = if cli_mode {
        run_cli(config, &cli.command, &cli.token).await
    } else {
        run_service(config).await
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "skeefree exiting with error");
            ExitCode::FAILURE
        }
    }
}

/// CLI mode: run one worker-agent command and exit.
async fn run_cli(config: Config, command: &str, token: &str) -> Result<()> {
    let state = Arc::new(AppState::new(config)?);
    run_command(&state, command, token).await
}

/// Service mode: run the election loop, the control loops, and the HTTP
/// server.
async fn run_service(config: Config) -> Result<()> {
    info!(
        http_addr = %config.http_addr,
        internal_addr = %config.internal_addr.as_deref().unwrap_or(""),
        pid = std::process::id(),
        "booting skeefree"
    );

    let state = Arc::new(AppState::new(config)?);
    info!(service_id = %state.backend.service_id(), "backend initialized");

    {
        let state = state.clone();
        tokio::spawn(async move {
            continuous_elections(state).await;
        });
    }
    continuous_operations(state.clone()).await;

    let app = router(state.clone());
    let bind_addr = state.cfg.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    info!(addr = %bind_addr, "server listening");

    axum::serve(listener, app)
        .await
        .context("server terminated")?;
    Ok(())
}
