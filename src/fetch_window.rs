//! Decides which date range a run has to request from the provider.

use chrono::{Duration, NaiveDate};
use serde::Serialize;

/// The range a run fetches, always open-ended up to "now"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchWindow {
    /// Nothing archived yet: fetch everything from the configured start
    FullFromDate { start: NaiveDate },
    /// Fetch from the day after the watermark
    Incremental { start: NaiveDate },
    /// The watermark already reaches yesterday or later
    AlreadyCurrent { watermark: NaiveDate },
}

impl FetchWindow {
    /// First date to request, or `None` when there is nothing to fetch
    pub fn start(&self) -> Option<NaiveDate> {
        match *self {
            FetchWindow::FullFromDate { start } | FetchWindow::Incremental { start } => Some(start),
            FetchWindow::AlreadyCurrent { .. } => None,
        }
    }

    pub fn is_current(&self) -> bool {
        matches!(self, FetchWindow::AlreadyCurrent { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchWindowPlanner {
    default_start: NaiveDate,
}

impl FetchWindowPlanner {
    pub fn new(default_start: NaiveDate) -> Self {
        Self { default_start }
    }

    pub fn default_start(&self) -> NaiveDate {
        self.default_start
    }

    /// Plan against the archive watermark. `today` is captured once by the caller
    /// and must stay fixed for the rest of the run.
    pub fn plan(&self, watermark: Option<NaiveDate>, today: NaiveDate) -> FetchWindow {
        match watermark {
            None => FetchWindow::FullFromDate {
                start: self.default_start,
            },
            Some(watermark) => {
                let next = watermark + Duration::days(1);
                if next >= today {
                    FetchWindow::AlreadyCurrent { watermark }
                } else {
                    FetchWindow::Incremental { start: next }
                }
            }
        }
    }

    /// Full rebuilds ignore the watermark entirely
    pub fn full_rebuild(&self) -> FetchWindow {
        FetchWindow::FullFromDate {
            start: self.default_start,
        }
    }
}
