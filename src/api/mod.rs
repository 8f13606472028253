use async_trait::async_trait;
use chrono::NaiveDate;
use std::time::Duration;

use crate::error::{ArchiveError, FetchError};
use crate::models::{Bar, Universe};

pub mod constituents;
pub mod yahoo_client;

pub use constituents::{universe_provider, ConstituentsCsv, WikipediaConstituents};
pub use yahoo_client::YahooChartClient;

/// Fixed pause between symbols so the upstream provider sees serial, spaced requests
#[derive(Debug, Clone, Copy)]
pub struct SymbolPacer {
    delay: Duration,
}

impl SymbolPacer {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub async fn wait(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

/// Source of the index membership for a run
#[async_trait]
pub trait UniverseProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the current constituents. An empty list counts as unavailable.
    async fn fetch_universe(&self) -> Result<Universe, ArchiveError>;
}

/// Source of daily bars for one symbol
#[async_trait]
pub trait BarFetcher: Send + Sync {
    /// Every daily bar from `start` through now. An empty vector means the
    /// provider had nothing for that range, which is not an error.
    async fn fetch_bars(&self, symbol: &str, start: NaiveDate) -> Result<Vec<Bar>, FetchError>;
}

#[async_trait]
impl<T: BarFetcher + ?Sized> BarFetcher for std::sync::Arc<T> {
    async fn fetch_bars(&self, symbol: &str, start: NaiveDate) -> Result<Vec<Bar>, FetchError> {
        (**self).fetch_bars(symbol, start).await
    }
}
