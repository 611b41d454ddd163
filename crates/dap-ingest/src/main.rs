//! DAP Ingest - Main entry point

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use dap_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use dap_ingest::{commands, Cli, Commands, Profile};
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Load .env before anything reads the environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("dap-ingest")
        .build();

    let code = match start(cli, log_config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        },
    };
    process::exit(code);
}

async fn start(cli: Cli, log_config: LogConfig) -> anyhow::Result<i32> {
    // LOG_* variables take precedence over flags
    let log_config = log_config.merge_env().context("Invalid logging environment")?;
    let _guard = init_logging(&log_config).context("Failed to initialize logging")?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling after the current step");
            signal_token.cancel();
        }
    });

    let result = execute_command(&cli, cancel).await;
    match result {
        Ok(code) => {
            info!(code, "Command finished");
            Ok(code)
        },
        Err(e) => {
            error!(error = %e, kind = %e.kind(), "Command failed");
            eprintln!("Error: {}", e);
            Ok(e.exit_code())
        },
    }
}

async fn execute_command(cli: &Cli, cancel: CancellationToken) -> dap_ingest::Result<i32> {
    let profile = Profile::load(&cli.profile)?;

    match &cli.command {
        Commands::Run { sources } => commands::run(profile, sources, cancel).await,
        Commands::Seed => commands::seed(profile).await,
        Commands::Sources => commands::sources(profile).await,
        Commands::Due => commands::due(profile, Utc::now()).await,
        Commands::Events { source, since } => commands::events(profile, source, *since).await,
    }
}
