//! Fakes shared by unit tests.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::browser::{Browser, BrowserError, Element, Form, Locator, Strategy};
use crate::config::{SearchInstruction, SiteConfig};
use crate::currency::{RateSource, RateStore, RateTable};
use crate::error::{PipelineError, Result};
use crate::locators::{LocatorSet, LocatorStore};

pub const TITLE_XPATH: &str = "/html/body/div[1]/a[1]/div[1]";
pub const PRICE_XPATH: &str = "/html/body/div[1]/a[1]/div[2]";
pub const TITLE_CLASS: &str = "KzDlHZ";
pub const PRICE_CLASS: &str = "Nx9bqj _4b5DiR";

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// USD 1, INR 80, EUR 0.8.
pub fn rate_table(next_refresh_at: DateTime<Utc>) -> RateTable {
    let rates: BTreeMap<String, f64> = [("USD", 1.0), ("INR", 80.0), ("EUR", 0.8)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    RateTable {
        base_currency: "USD".into(),
        rates,
        fetched_at: Utc::now(),
        next_refresh_at,
    }
}

#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Rate source returning a fixed table, or always failing.
pub struct FixedRates {
    table: Option<RateTable>,
    fetches: Counter,
}

impl FixedRates {
    pub fn new(table: RateTable) -> Self {
        Self {
            table: Some(table),
            fetches: Counter::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            table: None,
            fetches: Counter::default(),
        }
    }

    pub fn fetches(&self) -> Counter {
        self.fetches.clone()
    }
}

#[async_trait]
impl RateSource for FixedRates {
    async fn fetch(&self) -> Result<RateTable> {
        self.fetches.bump();
        self.table
            .clone()
            .ok_or_else(|| PipelineError::RateFetch("connection refused".into()))
    }
}

#[derive(Default)]
pub struct MemoryRateStore {
    table: Arc<Mutex<Option<RateTable>>>,
}

impl MemoryRateStore {
    pub fn with_table(table: RateTable) -> Self {
        Self {
            table: Arc::new(Mutex::new(Some(table))),
        }
    }

    /// Shared view of the stored table, for inspection after the store is moved.
    pub fn handle(&self) -> Arc<Mutex<Option<RateTable>>> {
        Arc::clone(&self.table)
    }
}

impl RateStore for MemoryRateStore {
    fn load(&self) -> io::Result<Option<RateTable>> {
        Ok(self.table.lock().unwrap().clone())
    }

    fn save(&self, table: &RateTable) -> io::Result<()> {
        *self.table.lock().unwrap() = Some(table.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryLocatorStore {
    sets: RwLock<HashMap<String, LocatorSet>>,
}

impl LocatorStore for MemoryLocatorStore {
    fn load(&self, category: &str) -> io::Result<Option<LocatorSet>> {
        Ok(self.sets.read().unwrap().get(category).cloned())
    }

    fn save(&self, category: &str, set: &LocatorSet) -> io::Result<()> {
        self.sets.write().unwrap().insert(category.to_string(), set.clone());
        Ok(())
    }

    fn clear(&self, category: &str) -> io::Result<()> {
        self.sets.write().unwrap().remove(category);
        Ok(())
    }
}

pub fn site() -> SiteConfig {
    SiteConfig {
        website_name: "flipkart".into(),
        url: "https://shop.test/".into(),
        calibration_keyword: "gionee smartphone".into(),
        title_reference: Locator::new(Strategy::XPath, TITLE_XPATH),
        price_reference: Locator::new(Strategy::XPath, PRICE_XPATH),
        search_input: Locator::new(Strategy::CssSelector, "input[placeholder*='search' i]"),
        source_currency: "INR".into(),
        element_wait_secs: 0,
    }
}

pub fn instruction(keyword: &str, regex: &str) -> SearchInstruction {
    SearchInstruction {
        category: "smartphone".into(),
        keyword: keyword.into(),
        filter_regex: regex.into(),
        case_insensitive: false,
        output_path: "data".into(),
    }
}

#[derive(Clone, Default)]
pub struct ResultPage {
    pub titles: Vec<String>,
    pub prices: Vec<String>,
}

impl ResultPage {
    pub fn new(listings: &[(&str, &str)]) -> Self {
        Self {
            titles: listings.iter().map(|(t, _)| t.to_string()).collect(),
            prices: listings.iter().map(|(_, p)| p.to_string()).collect(),
        }
    }
}

#[derive(Default)]
struct FakeState {
    /// Page shown by the last search, cleared on navigation.
    current: Option<ResultPage>,
    /// Renders per keyword; each search shows the next, the last one repeats.
    pages: HashMap<String, Vec<ResultPage>>,
    /// Upcoming listing lookups that time out.
    failures_left: usize,
    navigations: usize,
    searches: Vec<String>,
    xpath_lookups: usize,
    closed: usize,
}

/// Scripted browser: a search for a keyword shows the registered page.
#[derive(Clone, Default)]
pub struct FakeBrowser {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBrowser {
    pub fn with_page(self, keyword: &str, page: ResultPage) -> Self {
        self.with_renders(keyword, vec![page])
    }

    /// Successive searches for `keyword` show `renders` in order.
    pub fn with_renders(self, keyword: &str, renders: Vec<ResultPage>) -> Self {
        self.state().pages.insert(keyword.to_string(), renders);
        self
    }

    pub fn failing_lookups(self, n: usize) -> Self {
        self.state().failures_left = n;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn navigations(&self) -> usize {
        self.state().navigations
    }

    pub fn searches(&self) -> Vec<String> {
        self.state().searches.clone()
    }

    pub fn xpath_lookups(&self) -> usize {
        self.state().xpath_lookups
    }

    pub fn closed(&self) -> usize {
        self.state().closed
    }
}

fn div(class: &str, text: &str) -> Element {
    Element {
        tag: "div".into(),
        text: text.into(),
        attributes: [("class".to_string(), class.to_string())].into_iter().collect(),
        form: None,
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn navigate(&self, _url: &str) -> std::result::Result<(), BrowserError> {
        let mut state = self.state();
        state.navigations += 1;
        state.current = None;
        Ok(())
    }

    async fn locate_all(
        &self,
        locator: &Locator,
        timeout: Duration,
    ) -> std::result::Result<Vec<Element>, BrowserError> {
        let mut state = self.state();
        let timed_out = || BrowserError::Timeout {
            locator: locator.clone(),
            waited: timeout,
        };
        let page = state.current.clone().unwrap_or_default();

        match locator.strategy {
            Strategy::CssSelector => Ok(vec![Element {
                tag: "input".into(),
                attributes: [("name".to_string(), "q".to_string())].into_iter().collect(),
                form: Some(Form {
                    action: Some("/search".into()),
                }),
                ..Default::default()
            }]),
            Strategy::XPath => {
                state.xpath_lookups += 1;
                let found = match locator.selector.as_str() {
                    TITLE_XPATH => page.titles.first().map(|t| div(" KzDlHZ ", t)),
                    PRICE_XPATH => page.prices.first().map(|p| div(PRICE_CLASS, p)),
                    _ => None,
                };
                found.map(|el| vec![el]).ok_or_else(timed_out)
            }
            Strategy::ClassName => {
                if state.failures_left > 0 {
                    state.failures_left -= 1;
                    return Err(timed_out());
                }
                let texts = if locator.selector == TITLE_CLASS {
                    page.titles
                } else if locator.selector == PRICE_CLASS.replace(' ', ".") {
                    page.prices
                } else {
                    Vec::new()
                };
                let class = locator.selector.replace('.', " ");
                let elements: Vec<_> = texts.iter().map(|t| div(&class, t)).collect();
                if elements.is_empty() {
                    Err(timed_out())
                } else {
                    Ok(elements)
                }
            }
            _ => Err(BrowserError::Unsupported(locator.to_string())),
        }
    }

    async fn submit_text(&self, _element: &Element, text: &str) -> std::result::Result<(), BrowserError> {
        let mut state = self.state();
        let page = match state.pages.get_mut(text) {
            Some(renders) if renders.len() > 1 => Some(renders.remove(0)),
            Some(renders) => renders.first().cloned(),
            None => None,
        };
        state.current = page;
        state.searches.push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.state().closed += 1;
    }
}
