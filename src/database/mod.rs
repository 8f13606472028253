use chrono::NaiveDate;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ArchiveError;
use crate::models::Bar;

const CREATE_PRICES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS stock_prices (
        symbol TEXT NOT NULL,
        date TEXT NOT NULL,
        open REAL NOT NULL,
        high REAL NOT NULL,
        low REAL NOT NULL,
        close REAL NOT NULL,
        volume INTEGER NOT NULL,
        PRIMARY KEY (symbol, date)
    )
"#;

const UPSERT_BAR: &str = r#"
    INSERT INTO stock_prices (symbol, date, open, high, low, close, volume)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(symbol, date) DO UPDATE SET
        open = excluded.open,
        high = excluded.high,
        low = excluded.low,
        close = excluded.close,
        volume = excluded.volume
"#;

/// Row count, symbol count and watermark of the archive
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveStatus {
    pub total_rows: i64,
    pub symbols: i64,
    pub latest_date: Option<NaiveDate>,
}

/// Handle to the persisted `stock_prices` table.
///
/// Cloning is cheap and shares the underlying pool. All writes go through
/// [`UpsertBatch`], which is the only place a transaction is held open.
#[derive(Clone)]
pub struct ArchiveStore {
    pool: SqlitePool,
}

impl ArchiveStore {
    /// Open (creating the file if needed) the archive at `database_path`.
    ///
    /// The prices table itself is only created on first write, so a fresh file
    /// reports no watermark.
    pub async fn open(database_path: &str) -> Result<Self, ArchiveError> {
        let path = database_path.strip_prefix("sqlite:").unwrap_or(database_path);

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        info!("💾 Archive opened at {}", path);
        Ok(Self { pool })
    }

    /// Release every pooled connection. Pending batches must be finished first.
    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn table_exists(&self) -> Result<bool, ArchiveError> {
        let row = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'stock_prices'")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn ensure_schema(&self) -> Result<(), ArchiveError> {
        sqlx::query(CREATE_PRICES_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    /// Latest date present for any symbol; `None` when the archive is empty or has never been written.
    pub async fn latest_date(&self) -> Result<Option<NaiveDate>, ArchiveError> {
        if !self.table_exists().await? {
            debug!("stock_prices does not exist yet, no watermark");
            return Ok(None);
        }

        let row = sqlx::query("SELECT MAX(date) AS latest FROM stock_prices")
            .fetch_one(&self.pool)
            .await?;

        match row.get::<Option<String>, _>("latest") {
            Some(date_str) => NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
                .map(Some)
                .map_err(|e| ArchiveError::StoreUnavailable(sqlx::Error::Decode(Box::new(e)))),
            None => Ok(None),
        }
    }

    /// Total number of stored bars
    pub async fn count(&self) -> Result<i64, ArchiveError> {
        if !self.table_exists().await? {
            return Ok(0);
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stock_prices")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Number of stored bars for one symbol
    pub async fn symbol_count(&self, symbol: &str) -> Result<i64, ArchiveError> {
        if !self.table_exists().await? {
            return Ok(0);
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stock_prices WHERE symbol = ?")
            .bind(symbol)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Distinct symbols that have at least one bar
    pub async fn symbols(&self) -> Result<Vec<String>, ArchiveError> {
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }
        let symbols = sqlx::query_scalar("SELECT DISTINCT symbol FROM stock_prices ORDER BY symbol")
            .fetch_all(&self.pool)
            .await?;
        Ok(symbols)
    }

    pub async fn status(&self) -> Result<ArchiveStatus, ArchiveError> {
        let symbols = if self.table_exists().await? {
            sqlx::query_scalar("SELECT COUNT(DISTINCT symbol) FROM stock_prices")
                .fetch_one(&self.pool)
                .await?
        } else {
            0
        };

        Ok(ArchiveStatus {
            total_rows: self.count().await?,
            symbols,
            latest_date: self.latest_date().await?,
        })
    }

    pub async fn get_bar(&self, symbol: &str, date: NaiveDate) -> Result<Option<Bar>, ArchiveError> {
        if !self.table_exists().await? {
            return Ok(None);
        }
        let row = sqlx::query(
            "SELECT symbol, date, open, high, low, close, volume FROM stock_prices WHERE symbol = ? AND date = ?",
        )
        .bind(symbol)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| bar_from_row(&r)))
    }

    /// Bars for `symbol` with `from <= date <= to`, oldest first
    pub async fn bars_between(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<Bar>, ArchiveError> {
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT symbol, date, open, high, low, close, volume
            FROM stock_prices
            WHERE symbol = ? AND date >= ? AND date <= ?
            ORDER BY date
            "#,
        )
        .bind(symbol)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(bar_from_row).collect())
    }

    /// The most recent `limit` bars for `symbol`, oldest first
    pub async fn recent_bars(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>, ArchiveError> {
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT symbol, date, open, high, low, close, volume
            FROM stock_prices
            WHERE symbol = ?
            ORDER BY date DESC
            LIMIT ?
            "#,
        )
        .bind(symbol)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut bars: Vec<Bar> = rows.iter().map(bar_from_row).collect();
        bars.reverse();
        Ok(bars)
    }

    /// Open a write batch. The table is created here if it is missing.
    pub async fn begin_batch(&self) -> Result<UpsertBatch<'_>, ArchiveError> {
        self.ensure_schema().await?;
        Ok(UpsertBatch {
            store: self,
            tx: None,
            rows_written: 0,
            commits: 0,
        })
    }

    /// Insert or replace `bars` for `symbol` and commit immediately
    pub async fn upsert(&self, symbol: &str, bars: &[Bar]) -> Result<u64, ArchiveError> {
        let mut batch = self.begin_batch().await?;
        let written = batch.upsert(symbol, bars).await?;
        batch.finish().await?;
        Ok(written)
    }

    /// Drop and recreate the prices table. Every stored bar is lost.
    pub async fn reset(&self) -> Result<(), ArchiveError> {
        sqlx::query("DROP TABLE IF EXISTS stock_prices").execute(&self.pool).await?;
        self.ensure_schema().await?;
        info!("🗑️  Archive reset, all price data removed");
        Ok(())
    }

    /// (Re)build the symbol and date lookup indices after a bulk load.
    pub async fn rebuild_indexes(&self) -> Result<(), ArchiveError> {
        self.ensure_schema().await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_stock_prices_symbol ON stock_prices (symbol)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_stock_prices_date ON stock_prices (date)")
            .execute(&self.pool)
            .await?;
        sqlx::query("REINDEX stock_prices").execute(&self.pool).await?;
        sqlx::query("ANALYZE stock_prices").execute(&self.pool).await?;
        debug!("Lookup indices rebuilt");
        Ok(())
    }

    /// Names of the indices currently defined on the prices table
    pub async fn index_names(&self) -> Result<Vec<String>, ArchiveError> {
        let names = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'stock_prices' AND sql IS NOT NULL ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }
}

fn bar_from_row(r: &sqlx::sqlite::SqliteRow) -> Bar {
    Bar {
        symbol: r.get::<String, _>("symbol"),
        date: r.get::<NaiveDate, _>("date"),
        open: r.get::<f64, _>("open"),
        high: r.get::<f64, _>("high"),
        low: r.get::<f64, _>("low"),
        close: r.get::<f64, _>("close"),
        volume: r.get::<i64, _>("volume").max(0) as u64,
    }
}

/// Buffered writes against the archive.
///
/// Upserts accumulate in one open transaction until [`flush`](Self::flush) or
/// [`finish`](Self::finish) commits them. Dropping the batch rolls back whatever
/// was not flushed.
pub struct UpsertBatch<'a> {
    store: &'a ArchiveStore,
    tx: Option<Transaction<'static, Sqlite>>,
    rows_written: u64,
    commits: usize,
}

impl UpsertBatch<'_> {
    /// Insert or replace each bar keyed by (`symbol`, date). Returns the number of rows written.
    pub async fn upsert(&mut self, symbol: &str, bars: &[Bar]) -> Result<u64, ArchiveError> {
        let mut tx = match self.tx.take() {
            Some(tx) => tx,
            None => self.store.pool.begin().await?,
        };

        let mut written = 0;
        for bar in bars {
            sqlx::query(UPSERT_BAR)
                .bind(symbol)
                .bind(bar.date)
                .bind(bar.open)
                .bind(bar.high)
                .bind(bar.low)
                .bind(bar.close)
                .bind(i64::try_from(bar.volume).unwrap_or(i64::MAX))
                .execute(&mut *tx)
                .await?;
            written += 1;
        }

        self.tx = Some(tx);
        self.rows_written += written;
        Ok(written)
    }

    /// Commit everything written since the last flush
    pub async fn flush(&mut self) -> Result<(), ArchiveError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            self.commits += 1;
        }
        Ok(())
    }

    /// Commit the remainder and return the total rows written by this batch
    pub async fn finish(mut self) -> Result<u64, ArchiveError> {
        self.flush().await?;
        Ok(self.rows_written)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Number of transactions committed so far
    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn has_pending(&self) -> bool {
        self.tx.is_some()
    }
}
