//! S&P 500 constituent lists.

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{info, warn};

use super::UniverseProvider;
use crate::error::ArchiveError;
use crate::models::{Config, Constituent, Universe, UniverseSource};

pub const DEFAULT_CONSTITUENTS_CSV_URL: &str =
    "https://raw.githubusercontent.com/datasets/s-and-p-500-companies/main/data/constituents.csv";
pub const DEFAULT_WIKIPEDIA_URL: &str = "https://en.wikipedia.org/wiki/List_of_S%26P_500_companies";

const USER_AGENT: &str = "sp500-archive/0.1 (daily price archiver)";

fn http_client(timeout: Duration) -> Result<Client, ArchiveError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ArchiveError::Config(format!("HTTP client: {}", e)))
}

async fn download(client: &Client, url: &str) -> Result<String, ArchiveError> {
    let unavailable = |e: reqwest::Error| ArchiveError::UniverseUnavailable(format!("{}: {}", url, e));

    client
        .get(url)
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(unavailable)?
        .text()
        .await
        .map_err(unavailable)
}

fn non_empty(universe: Universe, source: &str) -> Result<Universe, ArchiveError> {
    if universe.is_empty() {
        return Err(ArchiveError::UniverseUnavailable(format!("{} returned no constituents", source)));
    }
    info!("✅ Parsed {} S&P 500 companies from {}", universe.len(), source);
    Ok(universe)
}

/// Parse a `Symbol,Security,...` CSV. Rows with fewer than two columns or an empty symbol are skipped.
pub fn parse_constituents_csv(text: &str) -> Result<Universe, ArchiveError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut companies = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| ArchiveError::UniverseUnavailable(format!("malformed constituents CSV: {}", e)))?;
        if record.len() < 2 {
            continue;
        }
        let symbol = record[0].trim();
        if symbol.is_empty() {
            warn!("Skipping constituent row without a symbol");
            continue;
        }
        companies.push(Constituent::new(symbol, record[1].trim()));
    }

    Ok(Universe::new(companies))
}

/// Read symbol and name from the first two cells of each row in the first `table.wikitable`.
pub fn parse_wikipedia_table(html: &str) -> Result<Universe, ArchiveError> {
    let selector = |s: &str| {
        Selector::parse(s).map_err(|e| ArchiveError::UniverseUnavailable(format!("selector {}: {:?}", s, e)))
    };
    let table_selector = selector("table.wikitable")?;
    let row_selector = selector("tr")?;
    let cell_selector = selector("td")?;

    let document = Html::parse_document(html);
    let Some(table) = document.select(&table_selector).next() else {
        return Err(ArchiveError::UniverseUnavailable("no wikitable on constituents page".into()));
    };

    let companies = table
        .select(&row_selector)
        .filter_map(|row| {
            let cells: Vec<String> = row
                .select(&cell_selector)
                .take(2)
                .map(|td| td.text().collect::<String>().trim().to_string())
                .collect();
            match cells.as_slice() {
                [symbol, name] if !symbol.is_empty() => Some(Constituent::new(symbol.as_str(), name.as_str())),
                _ => None,
            }
        })
        .collect();

    Ok(companies)
}

/// Constituents from the open `datasets/s-and-p-500-companies` CSV
pub struct ConstituentsCsv {
    client: Client,
    url: String,
}

impl ConstituentsCsv {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ArchiveError> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl UniverseProvider for ConstituentsCsv {
    fn name(&self) -> &str {
        "constituents-csv"
    }

    async fn fetch_universe(&self) -> Result<Universe, ArchiveError> {
        info!("🌐 Fetching S&P 500 list from {}", self.url);
        let text = download(&self.client, &self.url).await?;
        non_empty(parse_constituents_csv(&text)?, self.name())
    }
}

/// Constituents scraped from the Wikipedia list page
pub struct WikipediaConstituents {
    client: Client,
    url: String,
}

impl WikipediaConstituents {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ArchiveError> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl UniverseProvider for WikipediaConstituents {
    fn name(&self) -> &str {
        "wikipedia"
    }

    async fn fetch_universe(&self) -> Result<Universe, ArchiveError> {
        info!("🌐 Fetching S&P 500 list from {}", self.url);
        let html = download(&self.client, &self.url).await?;
        non_empty(parse_wikipedia_table(&html)?, self.name())
    }
}

/// Build the provider selected by `UNIVERSE_SOURCE`
pub fn universe_provider(config: &Config) -> Result<Box<dyn UniverseProvider>, ArchiveError> {
    let provider: Box<dyn UniverseProvider> = match config.universe_source {
        UniverseSource::ConstituentsCsv => Box::new(ConstituentsCsv::new(
            config.universe_url.as_deref().unwrap_or(DEFAULT_CONSTITUENTS_CSV_URL),
            config.request_timeout,
        )?),
        UniverseSource::Wikipedia => Box::new(WikipediaConstituents::new(
            config.universe_url.as_deref().unwrap_or(DEFAULT_WIKIPEDIA_URL),
            config.request_timeout,
        )?),
    };
    Ok(provider)
}
