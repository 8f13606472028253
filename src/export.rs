//! Flat-file mirror of fetched bars, one CSV per symbol.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::ArchiveError;
use crate::models::Bar;

#[derive(Serialize, Deserialize)]
struct MirrorRow {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Open")]
    open: f64,
    #[serde(rename = "High")]
    high: f64,
    #[serde(rename = "Low")]
    low: f64,
    #[serde(rename = "Close")]
    close: f64,
    #[serde(rename = "Volume")]
    volume: u64,
}

impl From<&Bar> for MirrorRow {
    fn from(bar: &Bar) -> Self {
        Self {
            date: bar.date.format("%Y-%m-%d").to_string(),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CsvMirror {
    dir: PathBuf,
}

impl CsvMirror {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<symbol>.csv`, with dots in the symbol turned into dashes
    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", symbol.replace('.', "-")))
    }

    /// Merge `bars` into the symbol's file keyed by date. A bar replaces any
    /// row already on file for its date, so writing the same bars twice leaves
    /// the file unchanged. Rows are kept in date order.
    pub fn write_symbol(&self, symbol: &str, bars: &[Bar]) -> Result<PathBuf, ArchiveError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(symbol);

        let mut rows = read_rows(&path)?;
        let existing = rows.len();
        for bar in bars {
            let row = MirrorRow::from(bar);
            rows.insert(row.date.clone(), row);
        }

        let mut writer = csv::Writer::from_path(&path)?;
        for row in rows.values() {
            writer.serialize(row)?;
        }
        writer.flush()?;

        debug!(
            "Mirrored {} rows of {} to {} ({} on file before)",
            bars.len(),
            symbol,
            path.display(),
            existing
        );
        Ok(path)
    }

    /// Remove the whole mirror directory (full rebuild)
    pub fn clear(&self) -> Result<(), ArchiveError> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
            info!("🗑️  Removed export mirror {}", self.dir.display());
        }
        Ok(())
    }
}

/// Rows already mirrored at `path`, keyed by their `Date` column
fn read_rows(path: &Path) -> Result<BTreeMap<String, MirrorRow>, ArchiveError> {
    let mut rows = BTreeMap::new();
    if !path.exists() {
        return Ok(rows);
    }

    let mut reader = csv::Reader::from_path(path)?;
    for result in reader.deserialize() {
        let row: MirrorRow = result?;
        rows.insert(row.date.clone(), row);
    }
    Ok(rows)
}
