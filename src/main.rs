// ABOUTME: Entry point for the fieldlog binary.
// ABOUTME: Loads config, initializes tracing, opens the SQLite store and runs one CLI command against the engine.

mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use fieldlog_core::{JobType, SystemClock};
use fieldlog_engine::{Engine, EngineConfig, JobQuery};
use fieldlog_store::SqliteStore;
use fieldlog_sync::HttpTransport;
use serde::Serialize;

use crate::cli::{Cli, Command};
use crate::config::AppConfig;

const DEFAULT_LOG_FILTER: &str = "fieldlog=info,fieldlog_engine=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("invalid configuration")?;
    std::fs::create_dir_all(&config.home)
        .with_context(|| format!("creating data directory {}", config.home.display()))?;

    let store = SqliteStore::open(&config.db_path())
        .with_context(|| format!("opening {}", config.db_path().display()))?;
    let transport = HttpTransport::new(config.api_url.clone())?;
    // One command per process: no background timers.
    let engine_config = EngineConfig {
        background_sync: false,
        ..config.engine.clone()
    };
    let engine = Engine::new(
        engine_config,
        Arc::new(store),
        Arc::new(transport),
        Arc::new(SystemClock),
    );
    tracing::debug!(home = %config.home.display(), api = %config.api_url, "fieldlog starting");

    engine.initialize(&[]).await?;
    let outcome = run(&engine, cli.command).await;
    engine.cleanup().await?;
    outcome
}

async fn run(engine: &Engine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Status => print_json(&engine.get_stats().await),
        Command::Pending => print_json(&engine.get_pending_jobs().await),
        Command::History {
            field,
            job_type,
            limit,
        } => {
            let mut query = JobQuery::new().limit(limit);
            if let Some(job_type) = job_type {
                query = query.of_type(JobType::from(job_type.as_str()));
            }
            print_json(&engine.get_history(&field, &query).await?)
        }
        Command::Sync => print_json(&engine.drain().await),
        Command::Hydrate { fields, force } => print_json(&engine.hydrate(&fields, force).await?),
        Command::Reset { yes } => {
            if !yes {
                bail!("reset erases unsynced jobs; rerun with --yes to confirm");
            }
            engine.reset().await?;
            println!("local state erased");
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
