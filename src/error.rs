//! Error types for archive runs.
//!
//! `ArchiveError` aborts a run. `FetchError` belongs to a single symbol and is
//! downgraded to summary data by the collector, so it never aborts anything.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("constituent list unavailable: {0}")]
    UniverseUnavailable(String),

    #[error("archive store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("export mirror failed: {0}")]
    Export(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<std::io::Error> for ArchiveError {
    fn from(e: std::io::Error) -> Self {
        ArchiveError::Export(e.to_string())
    }
}

impl From<csv::Error> for ArchiveError {
    fn from(e: csv::Error) -> Self {
        ArchiveError::Export(e.to_string())
    }
}

/// Why one symbol's bars could not be retrieved
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status} from provider")]
    Http { status: u16 },

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("response format changed: {0}")]
    ResponseFormat(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FetchError::ResponseFormat(e.to_string())
        } else {
            FetchError::Network(e.to_string())
        }
    }
}
