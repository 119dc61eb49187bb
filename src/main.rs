//! Attack dashboard - SSH honeypot log analytics
//!
//! Batch pipeline and query API for honeypot logs:
//! - `convert`: CSV logs to enriched, partitioned Parquet
//! - `build-summaries`: Parquet to DuckDB summary tables
//! - `verify`: cross-check the summary tables
//! - `serve`: JSON chart API over the summary tables

mod config;
mod db;
mod enrich;
mod error;
mod etl;
mod web;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "attack-dashboard", version, about)]
struct Cli {
    /// Configuration file (TOML); defaults to ./config.toml when present
    #[arg(short, long, env = "ATTACKDASH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert honeypot CSV files into partitioned Parquet
    Convert,
    /// Rebuild the summary tables from the Parquet output
    BuildSummaries,
    /// Check summary table totals against daily_stats
    Verify,
    /// Serve the chart API
    Serve,
}

fn init_logging(level: &str) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = config::Config::load(cli.config.as_deref())?;
    init_logging(&config.logging.level);

    match cli.command {
        Command::Convert => {
            let report = etl::convert(&config).await?;
            info!(
                "Converted {}/{} files ({} failed): {} rows written, {} skipped, {} enriched, {} parquet files",
                report.files_converted,
                report.files_found,
                report.files_failed,
                report.rows_written,
                report.rows_skipped,
                report.rows_enriched,
                report.parquet_files
            );
        }
        Command::BuildSummaries => {
            let db = db::Database::open(&config.database)?;
            let parquet_dir = config.paths.output_directory.clone();
            let report = db
                .run(move |conn| db::summaries::build_summaries(conn, &parquet_dir))
                .await?;
            info!(
                "Loaded {}/{} parquet files ({} failed) into {}",
                report.files_loaded,
                report.files_found,
                report.files_failed,
                config.database.path.display()
            );
        }
        Command::Verify => {
            let db = db::Database::open_read_only(&config.database.path)?;
            let report = db.run(db::verify::verify).await?;
            println!("daily_stats total: {}", report.total_attacks);
            for check in &report.checks {
                println!(
                    "{:<28} {:>12} diff {:>10} ({:.2}%) {:<10} {}",
                    check.table,
                    check.attacks,
                    check.difference,
                    check.difference_pct,
                    if check.exact { "exact" } else { "within 1%" },
                    if check.ok { "ok" } else { "MISMATCH" }
                );
            }
            if !report.is_ok() {
                bail!("summary tables do not match daily_stats");
            }
        }
        Command::Serve => {
            let db = db::Database::open_read_only(&config.database.path)?;
            info!("Opened {} read-only", config.database.path.display());
            web::start_server(&config, db).await?;
        }
    }

    Ok(())
}
