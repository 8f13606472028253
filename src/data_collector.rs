use chrono::NaiveDate;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::api::{BarFetcher, SymbolPacer};
use crate::database::ArchiveStore;
use crate::error::ArchiveError;
use crate::export::CsvMirror;
use crate::fetch_window::{FetchWindow, FetchWindowPlanner};
use crate::models::{Bar, Config, RunMode, Universe};

/// Tunables for one collector
#[derive(Debug, Clone, Copy)]
pub struct CollectorSettings {
    pub default_start: NaiveDate,
    /// Symbols processed between forced commits
    pub batch_size: usize,
    pub symbol_delay: Duration,
}

impl From<&Config> for CollectorSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_start: config.default_start_date,
            batch_size: config.batch_size,
            symbol_delay: config.symbol_delay,
        }
    }
}

/// What happened to one symbol during a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SymbolOutcome {
    Stored { rows: u64, rejected: usize },
    NoData,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolReport {
    pub symbol: String,
    #[serde(flatten)]
    pub outcome: SymbolOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolFailure {
    pub symbol: String,
    pub reason: String,
}

/// Aggregate result of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub window: FetchWindow,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<SymbolFailure>,
    pub skipped_empty: Vec<String>,
    pub rows_upserted: u64,
    pub rows_rejected: usize,
    /// Commits forced at batch boundaries, not counting the final one
    pub batch_flushes: usize,
    pub total_rows: i64,
    pub watermark: Option<NaiveDate>,
    pub outcomes: Vec<SymbolReport>,
}

impl RunSummary {
    fn new(window: FetchWindow) -> Self {
        Self {
            window,
            attempted: 0,
            succeeded: 0,
            failed: Vec::new(),
            skipped_empty: Vec::new(),
            rows_upserted: 0,
            rows_rejected: 0,
            batch_flushes: 0,
            total_rows: 0,
            watermark: None,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, symbol: &str, outcome: SymbolOutcome) {
        self.attempted += 1;
        match &outcome {
            SymbolOutcome::Stored { rows, rejected } => {
                self.succeeded += 1;
                self.rows_upserted += rows;
                self.rows_rejected += rejected;
            }
            SymbolOutcome::NoData => self.skipped_empty.push(symbol.to_string()),
            SymbolOutcome::Failed { reason } => self.failed.push(SymbolFailure {
                symbol: symbol.to_string(),
                reason: reason.clone(),
            }),
        }
        self.outcomes.push(SymbolReport {
            symbol: symbol.to_string(),
            outcome,
        });
    }

    /// True when the window was already current and nothing was fetched
    pub fn is_noop(&self) -> bool {
        self.window.is_current()
    }
}

/// Drives one archive run: plan, fetch each symbol in order, upsert, commit in batches.
pub struct DataCollector<F> {
    store: ArchiveStore,
    fetcher: F,
    planner: FetchWindowPlanner,
    pacer: SymbolPacer,
    batch_size: usize,
    mirror: Option<CsvMirror>,
}

impl<F: BarFetcher> DataCollector<F> {
    pub fn new(store: ArchiveStore, fetcher: F, settings: CollectorSettings) -> Self {
        Self {
            store,
            fetcher,
            planner: FetchWindowPlanner::new(settings.default_start),
            pacer: SymbolPacer::new(settings.symbol_delay),
            batch_size: settings.batch_size.max(1),
            mirror: None,
        }
    }

    /// Also write every stored symbol's bars to a CSV mirror
    pub fn with_mirror(mut self, mirror: CsvMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.store
    }

    /// Work out the fetch window for `mode` without changing anything.
    pub async fn plan(&self, mode: RunMode, today: NaiveDate) -> Result<FetchWindow, ArchiveError> {
        match mode {
            RunMode::FullRebuild => Ok(self.planner.full_rebuild()),
            RunMode::Incremental => {
                let watermark = self.store.latest_date().await?;
                let window = self.planner.plan(watermark, today);
                debug!("Watermark {:?}, today {} -> {:?}", watermark, today, window);
                Ok(window)
            }
        }
    }

    /// Plan and execute a run. A full rebuild wipes the archive (and mirror) first.
    pub async fn run(&self, mode: RunMode, universe: &Universe, today: NaiveDate) -> Result<RunSummary, ArchiveError> {
        if mode == RunMode::FullRebuild {
            info!("🧹 Full rebuild requested, resetting archive");
            self.store.reset().await?;
            if let Some(mirror) = &self.mirror {
                mirror.clear()?;
            }
        }

        let window = self.plan(mode, today).await?;
        self.execute(window, universe).await
    }

    /// Fetch and store every symbol in `universe` for an already planned window.
    pub async fn execute(&self, window: FetchWindow, universe: &Universe) -> Result<RunSummary, ArchiveError> {
        let mut summary = RunSummary::new(window);

        let start = match window {
            FetchWindow::AlreadyCurrent { watermark } => {
                info!("✅ Data is already up to date (latest date: {})", watermark);
                summary.watermark = Some(watermark);
                summary.total_rows = self.store.count().await?;
                return Ok(summary);
            }
            FetchWindow::FullFromDate { start } => {
                info!("📈 Starting full download from {} for {} symbols", start, universe.len());
                start
            }
            FetchWindow::Incremental { start } => {
                info!("🔄 Updating from {} to today for {} symbols", start, universe.len());
                start
            }
        };

        let total = universe.len();
        let mut batch = self.store.begin_batch().await?;

        for (index, constituent) in universe.iter().enumerate() {
            let position = index + 1;
            let symbol = constituent.symbol.as_str();
            info!("📊 Processing {} ({}/{})", symbol, position, total);

            let outcome = match self.fetcher.fetch_bars(symbol, start).await {
                Ok(bars) if bars.is_empty() => {
                    warn!("⚠️  {}: no data since {}", symbol, start);
                    SymbolOutcome::NoData
                }
                Ok(bars) => {
                    let (valid, rejected) = partition_well_formed(symbol, bars);
                    if valid.is_empty() {
                        warn!("⚠️  {}: all {} bars rejected", symbol, rejected);
                        SymbolOutcome::NoData
                    } else {
                        let rows = batch.upsert(symbol, &valid).await?;
                        if let Some(mirror) = &self.mirror {
                            mirror.write_symbol(symbol, &valid)?;
                        }
                        info!("✅ {}: {} bars stored", symbol, rows);
                        SymbolOutcome::Stored { rows, rejected }
                    }
                }
                Err(e) => {
                    error!("❌ {} failed: {}", symbol, e);
                    SymbolOutcome::Failed { reason: e.to_string() }
                }
            };
            summary.record(symbol, outcome);

            if position % self.batch_size == 0 {
                batch.flush().await?;
                summary.batch_flushes += 1;
                info!(
                    "📊 Progress: {}/{} symbols committed ({} ok, {} failed, {} empty)",
                    position,
                    total,
                    summary.succeeded,
                    summary.failed.len(),
                    summary.skipped_empty.len()
                );
            }

            if position < total {
                self.pacer.wait().await;
            }
        }

        batch.finish().await?;
        self.store.rebuild_indexes().await?;

        summary.total_rows = self.store.count().await?;
        summary.watermark = self.store.latest_date().await?;

        info!(
            "🏁 Run complete: {} attempted, {} stored, {} failed, {} empty, {} rows upserted",
            summary.attempted,
            summary.succeeded,
            summary.failed.len(),
            summary.skipped_empty.len(),
            summary.rows_upserted
        );
        Ok(summary)
    }
}

/// Keep bars that belong to `symbol` and are well formed; count the rest.
fn partition_well_formed(symbol: &str, bars: Vec<Bar>) -> (Vec<Bar>, usize) {
    let total = bars.len();
    let valid: Vec<Bar> = bars
        .into_iter()
        .filter(|bar| {
            if bar.symbol != symbol {
                warn!("Rejected bar for {} on {} returned for {}", bar.symbol, bar.date, symbol);
                return false;
            }
            let ok = bar.is_well_formed();
            if !ok {
                warn!("Rejected malformed bar for {} on {}", symbol, bar.date);
            }
            ok
        })
        .collect();
    let rejected = total - valid.len();
    (valid, rejected)
}
