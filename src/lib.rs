//! Incrementally refreshed SQLite archive of daily S&P 500 price bars.
//!
//! A run fetches the current constituents, plans a fetch window from the
//! archive watermark, pulls daily bars symbol by symbol and upserts them in
//! batched transactions. One symbol failing never stops the run.

pub mod api;
pub mod data_collector;
pub mod database;
pub mod error;
pub mod export;
pub mod fetch_window;
pub mod models;

pub use api::{BarFetcher, SymbolPacer, UniverseProvider};
pub use data_collector::{CollectorSettings, DataCollector, RunSummary, SymbolFailure, SymbolOutcome};
pub use database::{ArchiveStatus, ArchiveStore, UpsertBatch};
pub use error::{ArchiveError, FetchError};
pub use fetch_window::{FetchWindow, FetchWindowPlanner};
pub use models::{Bar, Config, Constituent, RunMode, Universe};
