pub mod rates;

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
pub use rates::{FileRateStore, HttpRateSource, RateSource, RateStore};

pub const USD: &str = "USD";

/// Symbols stripped from price text before parsing.
const CURRENCY_SYMBOLS: &str = "$€£¥₹₽₩฿₪₫₴₸₲₺₼₦₱₵₡₮₳₥៛₭₤";

/// Exchange rates relative to `base_currency`, valid until `next_refresh_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateTable {
    pub base_currency: String,
    pub rates: BTreeMap<String, f64>,
    pub fetched_at: DateTime<Utc>,
    pub next_refresh_at: DateTime<Utc>,
}

impl RateTable {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now > self.next_refresh_at
    }

    fn rate(&self, code: &str) -> Result<Decimal> {
        let raw = self
            .rates
            .get(code)
            .copied()
            .ok_or_else(|| PipelineError::UnknownCurrency(code.to_string()))?;
        Decimal::try_from(raw)
            .ok()
            .filter(|r| r.is_sign_positive() && !r.is_zero())
            .ok_or_else(|| PipelineError::UnknownCurrency(format!("{code} (rate {raw})")))
    }

    /// `amount * rates[to] / rates[from]`, rounded half-up to cents. The result
    /// always carries two decimal places.
    pub fn convert(&self, amount: Decimal, from: &str, to: &str) -> Result<Decimal> {
        let from = from.trim().to_ascii_uppercase();
        let to = to.trim().to_ascii_uppercase();
        let from_rate = self.rate(&from)?;
        let to_rate = self.rate(&to)?;
        let mut converted = amount
            .checked_mul(to_rate)
            .and_then(|v| v.checked_div(from_rate))
            .ok_or_else(|| {
                PipelineError::MalformedListing(format!("{amount} {from} overflows conversion to {to}"))
            })?
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        converted.rescale(2);
        Ok(converted)
    }
}

/// Parse a displayed price such as `"₹9,999"` or `"$ 1,234.50"`.
///
/// When several amounts share one string (`"₹9,999₹12,999"`) the first wins.
pub fn parse_price(text: &str) -> Result<Decimal> {
    let malformed = || PipelineError::MalformedListing(format!("unparseable price {text:?}"));

    let amount = text
        .split(|c: char| CURRENCY_SYMBOLS.contains(c))
        .map(|segment| {
            segment
                .chars()
                .filter(|c| *c != ',' && !c.is_whitespace())
                .collect::<String>()
        })
        .find(|s| !s.is_empty())
        .ok_or_else(malformed)?;

    let value = Decimal::from_str(&amount).map_err(|_| malformed())?;
    if value.is_sign_negative() && !value.is_zero() {
        return Err(PipelineError::MalformedListing(format!("negative price {text:?}")));
    }
    Ok(value)
}

#[derive(Default)]
struct RateState {
    table: Option<RateTable>,
    loaded: bool,
    /// Set once a refresh failed and the expired table was kept.
    stale_accepted: bool,
}

/// Converts amounts between currencies, refreshing the cached rate table
/// whenever it has expired.
pub struct CurrencyNormalizer {
    source: Box<dyn RateSource>,
    store: Box<dyn RateStore>,
    allow_stale_fallback: bool,
    state: Mutex<RateState>,
}

impl CurrencyNormalizer {
    pub fn new(
        source: Box<dyn RateSource>,
        store: Box<dyn RateStore>,
        allow_stale_fallback: bool,
    ) -> Self {
        Self {
            source,
            store,
            allow_stale_fallback,
            state: Mutex::new(RateState::default()),
        }
    }

    pub async fn to_usd(&self, amount: Decimal, from: &str) -> Result<Decimal> {
        self.convert(amount, from, USD).await
    }

    pub async fn convert(&self, amount: Decimal, from: &str, to: &str) -> Result<Decimal> {
        let mut state = self.state.lock().await;
        let table = self.fresh_table(&mut state).await?;
        table.convert(amount, from, to)
    }

    /// Return the current table, fetching a new one first if needed.
    pub async fn ensure_fresh_rates(&self) -> Result<RateTable> {
        let mut state = self.state.lock().await;
        self.fresh_table(&mut state).await.cloned()
    }

    async fn fresh_table<'a>(&self, state: &'a mut RateState) -> Result<&'a RateTable> {
        if !state.loaded {
            state.table = self.store.load()?;
            state.loaded = true;
        }

        let usable = match &state.table {
            Some(t) => state.stale_accepted || !t.is_stale(Utc::now()),
            None => false,
        };

        if !usable {
            match self.source.fetch().await {
                Ok(fresh) => {
                    self.store.save(&fresh)?;
                    info!(
                        base = %fresh.base_currency,
                        currencies = fresh.rates.len(),
                        next_refresh_at = %fresh.next_refresh_at,
                        "Currency rates updated and saved"
                    );
                    state.table = Some(fresh);
                    state.stale_accepted = false;
                }
                Err(e) => match &state.table {
                    Some(stale) if self.allow_stale_fallback => {
                        warn!(
                            error = %e,
                            expired_at = %stale.next_refresh_at,
                            "Rate refresh failed, using expired table"
                        );
                        state.stale_accepted = true;
                    }
                    _ => return Err(e),
                },
            }
        }

        state
            .table
            .as_ref()
            .ok_or_else(|| PipelineError::RateFetch("no exchange rate table available".into()))
    }
}
