use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sp500_archive::api::{universe_provider, YahooChartClient};
use sp500_archive::data_collector::{CollectorSettings, DataCollector, RunSummary};
use sp500_archive::database::ArchiveStore;
use sp500_archive::export::CsvMirror;
use sp500_archive::fetch_window::FetchWindow;
use sp500_archive::models::{Config, RunMode};

#[derive(Parser)]
#[command(name = "sp500-archive", version, about = "Keep a local SQLite archive of daily S&P 500 prices up to date")]
struct Cli {
    /// Archive database file (overrides DATABASE_PATH)
    #[arg(long)]
    database: Option<String>,

    /// Answer yes to every confirmation prompt
    #[arg(short = 'y', long)]
    yes: bool,

    /// Print summaries as JSON
    #[arg(long)]
    json: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
enum Command {
    /// Fetch only what is newer than the latest archived date
    Incremental,
    /// Delete the archive and download everything again from the default start date
    FullRebuild,
    /// Exit without doing anything
    Abort,
    /// Show archive size and latest date
    Status,
    /// Print the most recent bars for one symbol
    Show {
        symbol: String,
        #[arg(long, default_value_t = 10)]
        days: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "sp500_archive=debug" } else { "sp500_archive=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_target(false)
        .init();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }

    let command = match &cli.command {
        Some(command) => command.clone(),
        None => choose_mode()?,
    };

    match command {
        Command::Abort => {
            println!("👋 Exiting without changes");
            Ok(())
        }
        Command::Status => show_status(&config, cli.json).await,
        Command::Show { symbol, days } => show_symbol(&config, &symbol, days).await,
        Command::Incremental => run_update(&config, RunMode::Incremental, &cli).await,
        Command::FullRebuild => run_update(&config, RunMode::FullRebuild, &cli).await,
    }
}

/// Interactive menu used when no subcommand is given
fn choose_mode() -> Result<Command> {
    loop {
        println!();
        println!("Select update mode:");
        println!("  1. Incremental update (from the latest archived date to today)");
        println!("  2. Full re-download");
        println!("  3. Exit");
        match read_line("Enter choice (1-3): ")?.as_str() {
            "1" => return Ok(Command::Incremental),
            "2" => return Ok(Command::FullRebuild),
            "3" => return Ok(Command::Abort),
            _ => continue,
        }
    }
}

fn read_line(message: &str) -> Result<String> {
    print!("{}", message);
    io::stdout().flush()?;

    let mut input = String::new();
    if io::stdin().read_line(&mut input)? == 0 {
        anyhow::bail!("stdin closed while waiting for input");
    }
    Ok(input.trim().to_lowercase())
}

/// Prompt user for yes/no input until one of them is given
fn prompt_user(message: &str) -> Result<bool> {
    loop {
        match read_line(message)?.as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => println!("Please answer y or n"),
        }
    }
}

async fn run_update(config: &Config, mode: RunMode, cli: &Cli) -> Result<()> {
    if mode == RunMode::FullRebuild
        && !cli.yes
        && !prompt_user("This will overwrite all existing data. Continue? (y/n): ")?
    {
        println!("Operation cancelled");
        return Ok(());
    }

    let provider = universe_provider(config)?;
    let universe = provider
        .fetch_universe()
        .await
        .with_context(|| format!("Could not load the S&P 500 list from {}", provider.name()))?;

    if let Some(path) = &config.universe_snapshot_path {
        match universe.write_snapshot(path) {
            Ok(()) => info!("💾 Saved {} constituents to {}", universe.len(), path.display()),
            Err(e) => warn!("Could not save constituent snapshot to {}: {}", path.display(), e),
        }
    }

    let store = ArchiveStore::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open archive at {}", config.database_path))?;
    let fetcher = YahooChartClient::new(config)?;

    let mut collector = DataCollector::new(store.clone(), fetcher, CollectorSettings::from(config));
    if let Some(dir) = &config.export_dir {
        collector = collector.with_mirror(CsvMirror::new(dir));
    }

    // Held fixed for the whole run
    let today = Local::now().date_naive();

    let summary = match mode {
        RunMode::FullRebuild => collector.run(mode, &universe, today).await?,
        RunMode::Incremental => {
            let window = collector.plan(mode, today).await?;
            if let FetchWindow::FullFromDate { start } = window {
                println!("\nNo existing archive found.");
                if !cli.yes && !prompt_user(&format!("Perform a full download from {}? (y/n): ", start))? {
                    println!("Operation cancelled");
                    store.close().await;
                    return Ok(());
                }
            }
            collector.execute(window, &universe).await?
        }
    };

    print_summary(&summary, cli.json)?;
    store.close().await;
    Ok(())
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!();
    if !summary.is_noop() {
        println!("📋 Symbols attempted: {}", summary.attempted);
        println!("   ✅ stored:  {}", summary.succeeded);
        println!("   ❌ failed:  {}", summary.failed.len());
        println!("   ⚪ no data: {}", summary.skipped_empty.len());
        for failure in &summary.failed {
            println!("      {}: {}", failure.symbol, failure.reason);
        }
        if summary.rows_rejected > 0 {
            println!("   ⚠️  {} malformed bars rejected", summary.rows_rejected);
        }
    }
    println!("📊 Archive holds {} price records", summary.total_rows);
    match summary.watermark {
        Some(date) => println!("📅 Data current through: {}", date),
        None => println!("📅 Archive is empty"),
    }
    Ok(())
}

async fn show_status(config: &Config, json: bool) -> Result<()> {
    let store = ArchiveStore::open(&config.database_path).await?;
    let status = store.status().await?;
    store.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("📊 {} price records across {} symbols", status.total_rows, status.symbols);
        match status.latest_date {
            Some(date) => println!("📅 Data current through: {}", date),
            None => println!("📅 Archive is empty"),
        }
    }
    Ok(())
}

async fn show_symbol(config: &Config, symbol: &str, days: usize) -> Result<()> {
    let store = ArchiveStore::open(&config.database_path).await?;
    let symbol = symbol.to_uppercase();
    let bars = store.recent_bars(&symbol, days).await?;
    store.close().await;

    if bars.is_empty() {
        println!("No bars archived for {}", symbol);
        return Ok(());
    }

    println!("{:<12} {:>10} {:>10} {:>10} {:>10} {:>14}", "Date", "Open", "High", "Low", "Close", "Volume");
    for bar in bars {
        println!(
            "{:<12} {:>10.2} {:>10.2} {:>10.2} {:>10.2} {:>14}",
            bar.date.to_string(),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume
        );
    }
    Ok(())
}
