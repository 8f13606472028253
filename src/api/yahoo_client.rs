//! Daily bars from Yahoo's v8 chart endpoint.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::BarFetcher;
use crate::error::{ArchiveError, FetchError};
use crate::models::{Bar, Config};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartEnvelope,
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    #[serde(default)]
    meta: ChartMeta,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Default, Deserialize)]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: i64,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteData>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

/// The symbol as Yahoo spells it: class shares use a dash (`BRK.B` -> `BRK-B`).
pub fn provider_symbol(symbol: &str) -> String {
    symbol.trim().replace('.', "-")
}

fn is_no_data(description: &str) -> bool {
    let d = description.to_ascii_lowercase();
    d.contains("data doesn't exist") || d.contains("no data found")
}

/// Bar fetcher backed by the Yahoo chart API
pub struct YahooChartClient {
    client: Client,
    base_url: Url,
    limiter: DefaultDirectRateLimiter,
}

impl YahooChartClient {
    pub fn new(config: &Config) -> Result<Self, ArchiveError> {
        Self::with_base_url(&config.chart_base_url, config.rate_limit_per_minute, config.request_timeout)
    }

    /// `base_url` is the scheme and host; the chart path is appended to it.
    pub fn with_base_url(base_url: &str, rate_limit_per_minute: u32, timeout: Duration) -> Result<Self, ArchiveError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ArchiveError::Config(format!("chart base URL '{}': {}", base_url, e)))?;

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ArchiveError::Config(format!("HTTP client: {}", e)))?;

        let per_minute = NonZeroU32::new(rate_limit_per_minute).unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::direct(Quota::per_minute(per_minute));

        Ok(Self {
            client,
            base_url,
            limiter,
        })
    }

    fn chart_url(&self, symbol: &str, start: NaiveDate, end: DateTime<Utc>) -> Result<Url, FetchError> {
        let mut url = self
            .base_url
            .join(&format!("v8/finance/chart/{}", provider_symbol(symbol)))
            .map_err(|e| FetchError::Network(format!("bad chart URL for {}: {}", symbol, e)))?;

        let period1 = start.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc().timestamp();
        url.query_pairs_mut()
            .append_pair("period1", &period1.to_string())
            .append_pair("period2", &end.timestamp().to_string())
            .append_pair("interval", "1d")
            .append_pair("events", "history");
        Ok(url)
    }

    /// Turn a chart payload into bars dated on or after `start`
    fn parse_chart(symbol: &str, start: NaiveDate, chart: ChartResponse) -> Result<Vec<Bar>, FetchError> {
        let results = match chart.chart.result {
            Some(results) => results,
            None => {
                return match chart.chart.error {
                    Some(err) if err.code == "Not Found" => Err(FetchError::SymbolNotFound {
                        symbol: symbol.to_string(),
                    }),
                    Some(err) if is_no_data(&err.description) => Ok(Vec::new()),
                    Some(err) => Err(FetchError::ResponseFormat(format!("{}: {}", err.code, err.description))),
                    None => Err(FetchError::ResponseFormat("empty result with no error".into())),
                };
            }
        };

        let data = results
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::ResponseFormat("result array is empty".into()))?;

        // No timestamps: the range held no trading days
        let Some(timestamps) = data.timestamp else {
            return Ok(Vec::new());
        };

        let quote = data.indicators.quote.into_iter().next().unwrap_or_default();
        let offset = data.meta.gmtoffset;
        let mut bars = Vec::with_capacity(timestamps.len());

        for (i, &ts) in timestamps.iter().enumerate() {
            let date = DateTime::from_timestamp(ts + offset, 0)
                .map(|dt| dt.date_naive())
                .ok_or_else(|| FetchError::ResponseFormat(format!("invalid timestamp: {}", ts)))?;
            if date < start {
                continue;
            }

            let field = |v: &[Option<f64>]| v.get(i).copied().flatten();
            let (Some(open), Some(high), Some(low), Some(close)) =
                (field(&quote.open), field(&quote.high), field(&quote.low), field(&quote.close))
            else {
                debug!("{} {}: incomplete row skipped", symbol, date);
                continue;
            };

            bars.push(Bar {
                symbol: symbol.to_string(),
                date,
                open,
                high,
                low,
                close,
                volume: quote.volume.get(i).copied().flatten().unwrap_or(0),
            });
        }

        Ok(bars)
    }
}

#[async_trait]
impl BarFetcher for YahooChartClient {
    async fn fetch_bars(&self, symbol: &str, start: NaiveDate) -> Result<Vec<Bar>, FetchError> {
        let url = self.chart_url(symbol, start, Utc::now())?;
        self.limiter.until_ready().await;

        debug!("GET {}", url);
        let resp = self.client.get(url).send().await?;
        let status = resp.status();

        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::SymbolNotFound {
                symbol: symbol.to_string(),
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(FetchError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            // Out-of-range requests come back as 400 with a chart error body
            let body = resp.text().await.unwrap_or_default();
            return match serde_json::from_str::<ChartResponse>(&body) {
                Ok(chart) if chart.chart.error.as_ref().is_some_and(|e| is_no_data(&e.description)) => Ok(Vec::new()),
                _ => Err(FetchError::Http {
                    status: status.as_u16(),
                }),
            };
        }

        let chart: ChartResponse = resp
            .json()
            .await
            .map_err(|e| FetchError::ResponseFormat(format!("failed to parse response for {}: {}", symbol, e)))?;

        Self::parse_chart(symbol, start, chart)
    }
}
