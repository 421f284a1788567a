use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use super::RateTable;
use crate::error::{PipelineError, Result};
use crate::locators::write_atomic;

pub const DEFAULT_RATES_URL: &str = "https://open.er-api.com/v6/latest/USD";

/// Where fresh exchange rate tables come from.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch(&self) -> Result<RateTable>;
}

/// Persistence for the last fetched table.
pub trait RateStore: Send + Sync {
    fn load(&self) -> io::Result<Option<RateTable>>;
    fn save(&self, table: &RateTable) -> io::Result<()>;
}

// ── HTTP source ──

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    base_code: Option<String>,
    rates: BTreeMap<String, f64>,
    time_next_update_utc: String,
}

pub struct HttpRateSource {
    client: reqwest::Client,
    url: String,
}

impl HttpRateSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::RateFetch(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn fetch(&self) -> Result<RateTable> {
        info!(url = %self.url, "Fetching currency rates");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| PipelineError::RateFetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::RateFetch(format!(
                "{} returned status {status}",
                self.url
            )));
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::RateFetch(format!("invalid rate payload: {e}")))?;
        let next_refresh_at = parse_update_time(&body.time_next_update_utc)?;

        Ok(RateTable {
            base_currency: body.base_code.unwrap_or_else(|| super::USD.to_string()),
            rates: body.rates,
            fetched_at: Utc::now(),
            next_refresh_at,
        })
    }
}

/// The rate API reports times as RFC 2822 (`Fri, 27 Mar 2020 00:02:31 +0000`).
fn parse_update_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(s)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PipelineError::RateFetch(format!("bad time_next_update_utc {s:?}: {e}")))
}

// ── Stores ──

/// Table kept as a JSON file.
pub struct FileRateStore {
    path: PathBuf,
}

impl FileRateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RateStore for FileRateStore {
    fn load(&self) -> io::Result<Option<RateTable>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_str(&text) {
            Ok(table) => Ok(Some(table)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable rate cache");
                Ok(None)
            }
        }
    }

    fn save(&self, table: &RateTable) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(table)?;
        write_atomic(&self.path, &json)
    }
}
