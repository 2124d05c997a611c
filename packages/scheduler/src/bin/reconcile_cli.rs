//! CLI for concurrency ledger reconciliation
//!
//! Compares the ledger against the queue of record for one team (or every
//! tracked team), fixes drift both ways and promotes backlog entries that now
//! fit. Outputs JSON.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use scheduler_core::config::Config;
use scheduler_core::domains::concurrency::{AdmissionControl, RedisConcurrencyLedger, ReconcileReport};
use scheduler_core::kernel::jobs::PostgresJobQueue;
use scheduler_core::kernel::MetricsSnapshot;
use sqlx::PgPool;

#[derive(Parser)]
#[command(name = "reconcile_cli")]
#[command(about = "Concurrency ledger reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Only reconcile this team
    #[arg(long, global = true)]
    team: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fix ledger drift (default)
    Run,

    /// Print queue depth, backlog sizes and active leases
    Status,
}

#[derive(Serialize)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<ReconcileReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<MetricsSnapshot>,
}

fn output(resp: &Response) -> Result<()> {
    println!("{}", serde_json::to_string(resp)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let admission = connect().await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&admission, cli.team.as_deref()).await,
        Commands::Status => cmd_status(&admission).await,
    }
}

async fn connect() -> Result<AdmissionControl> {
    let config = Config::from_env()?;
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let ledger = RedisConcurrencyLedger::connect(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;

    Ok(AdmissionControl::new(
        Arc::new(PostgresJobQueue::new(pool)),
        Arc::new(ledger),
        config.admission,
    ))
}

async fn cmd_run(admission: &AdmissionControl, team: Option<&str>) -> Result<()> {
    let report = admission.reconcile(team).await?;
    let message = match team {
        Some(team) => format!("reconciled team {team}: {} drift entries fixed", report.drift()),
        None => format!(
            "reconciled {} ledgers: {} drift entries fixed",
            report.ledgers_checked,
            report.drift()
        ),
    };

    output(&Response {
        success: true,
        message: Some(message),
        report: Some(report),
        metrics: None,
    })
}

async fn cmd_status(admission: &AdmissionControl) -> Result<()> {
    let metrics = MetricsSnapshot::collect(admission.queue().as_ref(), admission).await?;
    output(&Response {
        success: true,
        message: None,
        report: None,
        metrics: Some(metrics),
    })
}
