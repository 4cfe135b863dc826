//! estate-engine - operator CLI for the fractional estate engine
//!
//! Applies schema migrations, runs a payout sweep on demand, or runs the
//! daily payout scheduler until interrupted.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

use estate_core::config::EngineConfig;
use estate_core::EstateEngine;
use estate_database::{DatabaseConfig, PgStore};
use fractional_estate::{LogNotifier, PayoutScheduler};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (debug, info, warn, error); RUST_LOG directives take precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Directory for the daily-rolling JSON log file
    #[arg(long, global = true, default_value = "logs")]
    log_dir: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Apply pending schema migrations
    Migrate,
    /// Run one payout sweep now and print the summary
    Payouts,
    /// Run a payout sweep every day at PAYOUT_HOUR until Ctrl-C
    Scheduler,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let _guard = init_tracing(&args.log_level, &args.log_dir)?;

    info!(command = ?args.command, "Starting {}", fractional_estate::BUILD_INFO);

    let db_config = DatabaseConfig::from_env().context("loading database configuration")?;
    let store = PgStore::connect(db_config)
        .await
        .context("connecting to PostgreSQL")?;

    if args.command == Command::Migrate {
        let report = store.migrate().await.context("applying migrations")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        store.close().await;
        return Ok(());
    }

    let engine_config = EngineConfig::from_env().context("loading engine configuration")?;
    let engine = EstateEngine::builder()
        .store(Arc::new(store.clone()))
        .notifier(Arc::new(LogNotifier))
        .config(engine_config)
        .build()?;

    match args.command {
        Command::Payouts => {
            let summary = engine.run_payouts().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Scheduler => {
            let scheduler = PayoutScheduler::new(engine)?;
            scheduler.run(shutdown_signal()).await;
        }
        Command::Migrate => {}
    }

    store.close().await;
    info!("estate-engine shut down gracefully");
    Ok(())
}

fn init_tracing(log_level: &str, log_dir: &str) -> Result<WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let file_appender = tracing_appender::rolling::daily(log_dir, "estate-engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let level_filter = match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let stdout_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_filter(EnvFilter::from_default_env().add_directive(level_filter.into()));

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_current_span(true)
        .with_span_list(true)
        .with_filter(EnvFilter::from_default_env().add_directive(level_filter.into()));

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal (Ctrl+C)"),
        Err(err) => error!(error = %err, "Failed to listen for shutdown signal"),
    }
}
