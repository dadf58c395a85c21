use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use nse_collector::calendar::display_date;
use nse_collector::models::Config;
use nse_collector::pipeline::{clear_caches, Pipeline};

#[derive(Parser)]
#[command(
    name = "nse-collector",
    version,
    about = "Incremental collector for daily NSE/BSE market statistics"
)]
struct Cli {
    /// First candidate date (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<NaiveDate>,

    /// Last candidate date (YYYY-MM-DD); defaults to today
    #[arg(long)]
    end_date: Option<NaiveDate>,

    /// Combined output CSV path
    #[arg(long)]
    output: Option<PathBuf>,

    /// Directory holding the per-source cache files
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch missing dates and rewrite the output table (the default)
    Run,
    /// Show per-source cache coverage without making any requests
    Status,
    /// Delete cache files so the next run re-fetches from scratch
    ClearCache {
        /// Clear only this source's cache (default: all sources)
        source: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env()?;
    if let Some(date) = cli.start_date {
        config.start_date = date;
    }
    if let Some(date) = cli.end_date {
        config.end_date = Some(date);
    }
    if let Some(path) = cli.output {
        config.output_path = path;
    }
    if let Some(path) = cli.cache_dir {
        config.cache_dir = path;
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            Pipeline::new(config)?.run().await?;
        }
        Command::Status => {
            let pipeline = Pipeline::new(config)?;
            for source in pipeline.status() {
                match source.latest {
                    Some(latest) => println!(
                        "{:<12} {:>5} dates cached, latest {}",
                        source.id,
                        source.entries,
                        display_date(latest)
                    ),
                    None => println!("{:<12} empty", source.id),
                }
            }
        }
        Command::ClearCache { source } => {
            let removed = clear_caches(&config, source.as_deref())?;
            println!("Removed {} cache file(s)", removed);
        }
    }
    Ok(())
}
