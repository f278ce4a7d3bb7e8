//! Operator CLI: run-once entry points into the polling engine.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use agmon_config::Settings;
use agmon_db::{PgStore, Store};
use agmon_engine::{build_worker, gather_range, reconcile, AlertCoordinator};
use agmon_notify::{LogNotifier, Notifier};
use agmon_parse::pdf::LopdfExtractor;
use agmon_registry::calendar::Clock;
use agmon_registry::RegistryCell;

#[derive(Parser)]
#[command(name = "agmon")]
#[command(about = "Market report monitor CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Seed default report configs and recipients into the store
    Seed,

    /// Run one report's worker once and exit
    Run {
        #[arg(long)]
        report_id: String,

        /// Force a report date (YYYY-MM-DD) instead of searching from today
        #[arg(long)]
        report_date: Option<String>,
    },

    /// Backfill a date range for one report
    Gather {
        #[arg(long)]
        report_id: String,

        /// Inclusive start date (YYYY-MM-DD)
        #[arg(long)]
        start: String,

        /// Inclusive end date (YYYY-MM-DD)
        #[arg(long)]
        end: String,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = agmon_db::pg::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = agmon_db::pg::status(&pool).await?;
                    println!("db_ok={} has_reports_table={}", s.ok, s.has_reports_table);
                }
                DbCmd::Migrate => {
                    agmon_db::pg::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Seed => {
            let (_store, registry) = connect_and_reconcile().await?;
            println!("seeded_reports={}", registry.load().len());
        }

        Commands::Run {
            report_id,
            report_date,
        } => {
            let settings = Settings::from_env()?;
            let (store, registry) = connect_and_reconcile().await?;
            let config = registry
                .load()
                .get(&report_id)
                .ok_or_else(|| anyhow!("report not found: {report_id}"))?;

            let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
            let alerts = AlertCoordinator::new(
                Arc::clone(&notifier),
                settings.master_alert_email.clone(),
                settings.alert_failures_threshold,
            );
            let mut worker = build_worker(
                config,
                Clock::new(settings.app_timezone),
                Arc::new(LopdfExtractor),
            );
            if let Some(raw) = report_date {
                worker = worker.with_forced_date(parse_date(&raw)?);
            }

            let ok = worker.run(&*store, &*notifier, &alerts).await;
            println!("report_id={report_id} success={ok}");
            if !ok {
                std::process::exit(1);
            }
        }

        Commands::Gather {
            report_id,
            start,
            end,
        } => {
            let (store, registry) = connect_and_reconcile().await?;
            let config = registry
                .load()
                .get(&report_id)
                .ok_or_else(|| anyhow!("report not found: {report_id}"))?;
            let summary =
                gather_range(&*store, &config, parse_date(&start)?, parse_date(&end)?).await?;
            println!(
                "report_id={report_id} inserted={} skipped={}",
                summary.inserted, summary.skipped
            );
        }
    }

    Ok(())
}

async fn connect_and_reconcile() -> Result<(Arc<dyn Store>, Arc<RegistryCell>)> {
    let pool = agmon_db::pg::connect_from_env().await?;
    agmon_db::pg::migrate(&pool).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let registry = Arc::new(RegistryCell::with_defaults());
    reconcile(&*store, &registry).await?;
    Ok((store, registry))
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| anyhow!("invalid date (expected YYYY-MM-DD): {raw}"))
}
