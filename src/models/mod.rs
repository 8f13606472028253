use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ArchiveError;

/// One trading day's price record for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    /// A bar is storable when it names a symbol and every price is a finite, non-negative number.
    pub fn is_well_formed(&self) -> bool {
        !self.symbol.trim().is_empty()
            && [self.open, self.high, self.low, self.close]
                .iter()
                .all(|p| p.is_finite() && *p >= 0.0)
    }
}

/// A single index member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constituent {
    pub symbol: String,
    pub name: String,
}

impl Constituent {
    pub fn new(symbol: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            name: name.into(),
        }
    }
}

/// The ordered working set of symbols for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Universe {
    constituents: Vec<Constituent>,
}

#[derive(Serialize)]
struct SnapshotRow<'a> {
    ticker: &'a str,
    company: &'a str,
}

impl Universe {
    pub fn new(constituents: Vec<Constituent>) -> Self {
        Self { constituents }
    }

    pub fn len(&self) -> usize {
        self.constituents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constituents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constituent> {
        self.constituents.iter()
    }

    pub fn symbols(&self) -> Vec<&str> {
        self.constituents.iter().map(|c| c.symbol.as_str()).collect()
    }

    /// Save the list as a `ticker,company` CSV so operators can see what a run worked from.
    pub fn write_snapshot(&self, path: &Path) -> Result<(), ArchiveError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        for c in &self.constituents {
            writer.serialize(SnapshotRow {
                ticker: &c.symbol,
                company: &c.name,
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl FromIterator<Constituent> for Universe {
    fn from_iter<I: IntoIterator<Item = Constituent>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// How a run treats the existing archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Fetch only what is newer than the watermark
    Incremental,
    /// Drop the archive and refetch from the default start date
    FullRebuild,
}

/// Where the constituent list comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniverseSource {
    ConstituentsCsv,
    Wikipedia,
}

/// Configuration for the application
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub default_start_date: NaiveDate,
    pub batch_size: usize,
    pub symbol_delay: Duration,
    pub rate_limit_per_minute: u32,
    pub request_timeout: Duration,
    pub universe_source: UniverseSource,
    pub universe_url: Option<String>,
    pub universe_snapshot_path: Option<PathBuf>,
    pub export_dir: Option<PathBuf>,
    pub chart_base_url: String,
}

pub const DEFAULT_START_DATE: &str = "2023-01-01";
pub const DEFAULT_CHART_BASE_URL: &str = "https://query2.finance.yahoo.com";

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ArchiveError> {
        dotenvy::dotenv().ok(); // Load .env file if it exists

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup; missing keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ArchiveError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let start_raw = lookup("DEFAULT_START_DATE").unwrap_or_else(|| DEFAULT_START_DATE.to_string());
        let default_start_date = NaiveDate::parse_from_str(start_raw.trim(), "%Y-%m-%d")
            .map_err(|e| ArchiveError::Config(format!("DEFAULT_START_DATE '{}': {}", start_raw, e)))?;

        let batch_size: usize = parse_var("BATCH_SIZE", lookup("BATCH_SIZE"), 5)?;
        if batch_size == 0 {
            return Err(ArchiveError::Config("BATCH_SIZE must be at least 1".to_string()));
        }

        let universe_source = match lookup("UNIVERSE_SOURCE").as_deref().map(str::trim) {
            None | Some("") | Some("csv") => UniverseSource::ConstituentsCsv,
            Some("wikipedia") => UniverseSource::Wikipedia,
            Some(other) => {
                return Err(ArchiveError::Config(format!(
                    "UNIVERSE_SOURCE must be 'csv' or 'wikipedia', got '{}'",
                    other
                )))
            }
        };

        // An explicitly empty path switches the optional outputs off
        let optional_path = |key: &str, default: &str| -> Option<PathBuf> {
            match lookup(key) {
                Some(v) if v.trim().is_empty() => None,
                Some(v) => Some(PathBuf::from(v.trim())),
                None => Some(PathBuf::from(default)),
            }
        };

        Ok(Config {
            database_path: lookup("DATABASE_PATH").unwrap_or_else(|| "sp500_stock_data.db".to_string()),
            default_start_date,
            batch_size,
            symbol_delay: Duration::from_millis(parse_var("SYMBOL_DELAY_MS", lookup("SYMBOL_DELAY_MS"), 1000)?),
            rate_limit_per_minute: parse_var("RATE_LIMIT_PER_MINUTE", lookup("RATE_LIMIT_PER_MINUTE"), 120)?,
            request_timeout: Duration::from_secs(parse_var(
                "REQUEST_TIMEOUT_SECS",
                lookup("REQUEST_TIMEOUT_SECS"),
                30,
            )?),
            universe_source,
            universe_url: lookup("UNIVERSE_URL").filter(|v| !v.trim().is_empty()),
            universe_snapshot_path: optional_path("UNIVERSE_SNAPSHOT_PATH", "sp500StkCode.csv"),
            export_dir: optional_path("EXPORT_DIR", "Stk_data"),
            chart_base_url: lookup("CHART_BASE_URL").unwrap_or_else(|| DEFAULT_CHART_BASE_URL.to_string()),
        })
    }
}

/// Parse a numeric setting; unset or blank takes `default`, anything unparsable is an error.
fn parse_var<T>(key: &str, value: Option<String>, default: T) -> Result<T, ArchiveError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| ArchiveError::Config(format!("{} '{}': {}", key, raw, e))),
    }
}
