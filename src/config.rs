use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::browser::{Locator, Strategy};
use crate::currency::rates::DEFAULT_RATES_URL;

pub const DEFAULT_CONFIG_PATH: &str = "scraper.toml";
const ENV_PREFIX: &str = "SCRAPER";

const FLIPKART_URL: &str = "https://www.flipkart.com/";
const PRODUCT_TITLE_XPATH: &str =
    "/html/body/div[1]/div[1]/div[3]/div[1]/div[2]/div[2]/div[1]/div[1]/div[1]/a[1]/div[2]/div[1]/div[1]";
const PRODUCT_PRICE_XPATH: &str =
    "/html/body/div[1]/div[1]/div[3]/div[1]/div[2]/div[2]/div[1]/div[1]/div[1]/a[1]/div[2]/div[2]/div[1]/div[1]/div[1]";

/// One unit of scrape-transform-persist work.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SearchInstruction {
    pub category: String,
    pub keyword: String,
    pub filter_regex: String,
    #[serde(default)]
    pub case_insensitive: bool,
    pub output_path: String,
}

impl SearchInstruction {
    /// `category/keyword`, used in logs and reports.
    pub fn id(&self) -> String {
        format!("{}/{}", self.category, self.keyword)
    }
}

/// Per-site locators and conventions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Natural key of the website dimension row.
    pub website_name: String,
    pub url: String,
    /// Keyword whose first result is stable enough to derive selectors from.
    pub calibration_keyword: String,
    pub title_reference: Locator,
    pub price_reference: Locator,
    pub search_input: Locator,
    pub source_currency: String,
    pub element_wait_secs: u64,
}

impl SiteConfig {
    pub fn element_wait(&self) -> Duration {
        Duration::from_secs(self.element_wait_secs)
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            website_name: "flipkart".into(),
            url: FLIPKART_URL.into(),
            calibration_keyword: "gionee smartphone".into(),
            title_reference: Locator::new(Strategy::XPath, PRODUCT_TITLE_XPATH),
            price_reference: Locator::new(Strategy::XPath, PRODUCT_PRICE_XPATH),
            search_input: Locator::new(Strategy::CssSelector, "input[placeholder*='search' i]"),
            source_currency: "INR".into(),
            element_wait_secs: 10,
        }
    }
}

/// Exponential backoff for one stage.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    /// Defaults to 100x the initial interval.
    pub maximum_interval_ms: Option<u64>,
    pub maximum_attempts: u32,
    pub start_to_close_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1000,
            backoff_coefficient: 2.0,
            maximum_interval_ms: None,
            maximum_attempts: 3,
            start_to_close_timeout_ms: 45_000,
        }
    }
}

impl RetryPolicy {
    pub fn start_to_close_timeout(&self) -> Duration {
        Duration::from_millis(self.start_to_close_timeout_ms)
    }

    /// Sleep before attempt `next` (2-based): `initial * coefficient^(next - 2)`, capped.
    pub fn backoff(&self, next: u32) -> Duration {
        let cap = self
            .maximum_interval_ms
            .unwrap_or(self.initial_interval_ms.saturating_mul(100)) as f64;
        let exp = next.saturating_sub(2) as i32;
        let ms = (self.initial_interval_ms as f64 * self.backoff_coefficient.powi(exp)).min(cap);
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub extract: RetryPolicy,
    pub transform: RetryPolicy,
    pub persist: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CurrencyConfig {
    pub rates_url: String,
    pub cache_path: String,
    /// Keep converting with an expired table when a refresh fails.
    pub allow_stale_fallback: bool,
    pub request_timeout_secs: u64,
}

impl Default for CurrencyConfig {
    fn default() -> Self {
        Self {
            rates_url: DEFAULT_RATES_URL.into(),
            cache_path: "data/cache/currency_rates.json".into(),
            allow_stale_fallback: true,
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: String,
    pub locator_cache_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "data/listings.sqlite".into(),
            locator_cache_dir: "data/cache/locators".into(),
        }
    }
}

/// Where persisted listings go.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Database,
    Csv,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub site: SiteConfig,
    pub instructions: Vec<SearchInstruction>,
    pub retry: RetryConfig,
    pub currency: CurrencyConfig,
    pub storage: StorageConfig,
    pub output: OutputMode,
    pub page_load_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let smartphone = |keyword: &str, regex: &str| SearchInstruction {
            category: "smartphone".into(),
            keyword: keyword.into(),
            filter_regex: regex.into(),
            case_insensitive: false,
            output_path: "data/flipkart".into(),
        };
        Self {
            site: SiteConfig::default(),
            // The calibration keyword goes first so selectors are derived from it.
            instructions: vec![
                smartphone("gionee smartphone", r".*GIONEE.*\([^)]*\)"),
                smartphone("samsung smartphone", r".*SAMSUNG.*\([^)]*\)"),
                smartphone("apple iphone", r".*Apple iPhone.*\([^)]*\)"),
            ],
            retry: RetryConfig::default(),
            currency: CurrencyConfig::default(),
            storage: StorageConfig::default(),
            output: OutputMode::default(),
            page_load_timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Layer the TOML file (optional unless given explicitly) under
    /// `SCRAPER__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (file, required) = match path {
            Some(p) => (p, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };

        let settings: Settings = Config::builder()
            .add_source(File::from(file).required(required))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .with_context(|| format!("Failed to read config {}", file.display()))?
            .try_deserialize()
            .context("Invalid configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instructions.is_empty() {
            bail!("no search instructions configured");
        }
        for (stage, policy) in [
            ("extract", &self.retry.extract),
            ("transform", &self.retry.transform),
            ("persist", &self.retry.persist),
        ] {
            if policy.maximum_attempts == 0 {
                bail!("retry.{stage}.maximum_attempts must be at least 1");
            }
            if policy.backoff_coefficient < 1.0 {
                bail!("retry.{stage}.backoff_coefficient must be >= 1.0");
            }
        }
        if self.site.source_currency.trim().is_empty() {
            bail!("site.source_currency is empty");
        }
        Ok(())
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }
}
