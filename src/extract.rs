use std::time::Duration;

use tracing::{debug, info};

use crate::browser::{Browser, Element, Locator, Strategy};
use crate::config::{SearchInstruction, SiteConfig};
use crate::currency::parse_price;
use crate::error::{PipelineError, Result};
use crate::locators::{LocatorSet, LocatorStore};

/// One captured listing, exactly as the page shows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawListing {
    pub title: String,
    pub price: String,
}

/// Title and price texts in page order. The two lists are collected by
/// separate lookups and are checked against each other before leaving
/// the extract stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawListings {
    pub titles: Vec<String>,
    pub prices: Vec<String>,
}

impl RawListings {
    pub fn pairs(&self) -> Result<Vec<RawListing>> {
        if self.titles.len() != self.prices.len() {
            return Err(PipelineError::MalformedListing(format!(
                "found {} titles but {} prices",
                self.titles.len(),
                self.prices.len()
            )));
        }
        Ok(self
            .titles
            .iter()
            .zip(&self.prices)
            .map(|(title, price)| RawListing {
                title: title.clone(),
                price: price.clone(),
            })
            .collect())
    }

    /// Reject a render whose titles and prices cannot be paired and parsed.
    /// Failing here keeps the malformed retry on a fresh page.
    pub fn validate(&self) -> Result<()> {
        for RawListing { title, price } in self.pairs()? {
            if title.trim().is_empty() {
                return Err(PipelineError::MalformedListing(format!(
                    "empty title for price {price:?}"
                )));
            }
            parse_price(&price)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Extraction {
    pub listings: RawListings,
    pub locators: LocatorSet,
    /// True when selectors were derived during this call.
    pub calibrated: bool,
}

/// Search for the instruction's keyword and collect title/price texts.
///
/// Without cached selectors the calibration keyword is searched first and
/// selectors are derived from its reference result, then saved to `store`.
pub async fn extract(
    browser: &dyn Browser,
    site: &SiteConfig,
    instruction: &SearchInstruction,
    cached: Option<LocatorSet>,
    store: &dyn LocatorStore,
) -> Result<Extraction> {
    let wait = site.element_wait();

    let (locators, calibrated) = match cached {
        Some(set) => {
            debug!(category = %instruction.category, "Using cached locators");
            search(browser, site, &instruction.keyword).await?;
            (set, false)
        }
        None => {
            search(browser, site, &site.calibration_keyword).await?;
            let set = calibrate(browser, site).await?;
            store.save(&instruction.category, &set)?;
            if instruction.keyword != site.calibration_keyword {
                search(browser, site, &instruction.keyword).await?;
            }
            (set, true)
        }
    };

    let titles = texts(
        browser,
        &Locator::new(Strategy::ClassName, &locators.title_selector),
        wait,
    )
    .await?;
    let prices = texts(
        browser,
        &Locator::new(Strategy::ClassName, &locators.price_selector),
        wait,
    )
    .await?;

    info!(
        instruction = %instruction.id(),
        titles = titles.len(),
        prices = prices.len(),
        "Fetched product elements"
    );

    let listings = RawListings { titles, prices };
    listings.validate()?;

    Ok(Extraction {
        listings,
        locators,
        calibrated,
    })
}

/// Drop the cached selectors for `category` and derive new ones.
pub async fn recalibrate(
    browser: &dyn Browser,
    site: &SiteConfig,
    category: &str,
    store: &dyn LocatorStore,
) -> Result<LocatorSet> {
    store.clear(category)?;
    search(browser, site, &site.calibration_keyword).await?;
    let set = calibrate(browser, site).await?;
    store.save(category, &set)?;
    Ok(set)
}

async fn search(browser: &dyn Browser, site: &SiteConfig, keyword: &str) -> Result<()> {
    browser.navigate(&site.url).await?;
    let input = browser.locate_one(&site.search_input, site.element_wait()).await?;
    browser.submit_text(&input, keyword).await?;
    info!(keyword, "Searched for products");
    Ok(())
}

/// Derive selectors from the class attributes of the reference title and price.
async fn calibrate(browser: &dyn Browser, site: &SiteConfig) -> Result<LocatorSet> {
    let wait = site.element_wait();
    let title = browser.locate_one(&site.title_reference, wait).await?;
    let price = browser.locate_one(&site.price_reference, wait).await?;

    let set = LocatorSet {
        title_selector: class_selector(&title, &site.title_reference)?,
        price_selector: class_selector(&price, &site.price_reference)?,
    };
    info!(
        title = %set.title_selector,
        price = %set.price_selector,
        "Derived product class attributes"
    );
    Ok(set)
}

fn class_selector(element: &Element, reference: &Locator) -> Result<String> {
    let selector = LocatorSet::selector_from_class(element.attr("class").unwrap_or(""));
    if selector.is_empty() {
        return Err(PipelineError::ElementNotFound(format!(
            "reference element {reference} has no class attribute"
        )));
    }
    Ok(selector)
}

async fn texts(browser: &dyn Browser, locator: &Locator, wait: Duration) -> Result<Vec<String>> {
    Ok(browser
        .locate_all(locator, wait)
        .await?
        .into_iter()
        .map(|el| el.text)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{instruction, site, FakeBrowser, MemoryLocatorStore, ResultPage};

    fn gionee_page() -> ResultPage {
        ResultPage::new(&[("GIONEE Max (64GB)", "₹9,999"), ("Other Phone", "₹5,000")])
    }

    #[tokio::test]
    async fn first_extraction_calibrates_and_caches() {
        let browser = FakeBrowser::default().with_page("gionee smartphone", gionee_page());
        let store = MemoryLocatorStore::default();
        let instr = instruction("gionee smartphone", ".*");

        let out = extract(&browser, &site(), &instr, None, &store).await.unwrap();

        assert!(out.calibrated);
        assert_eq!(out.locators.title_selector, "KzDlHZ");
        assert_eq!(out.locators.price_selector, "Nx9bqj._4b5DiR");
        assert_eq!(store.load("smartphone").unwrap(), Some(out.locators.clone()));
        assert_eq!(out.listings.titles, vec!["GIONEE Max (64GB)", "Other Phone"]);
        assert_eq!(out.listings.prices, vec!["₹9,999", "₹5,000"]);
        assert_eq!(browser.xpath_lookups(), 2);
        assert_eq!(browser.searches(), vec!["gionee smartphone"]);
    }

    #[tokio::test]
    async fn cached_locators_skip_structural_discovery() {
        let browser = FakeBrowser::default()
            .with_page("gionee smartphone", gionee_page())
            .with_page("apple iphone", ResultPage::new(&[("Apple iPhone 13 (128GB)", "₹59,999")]));
        let store = MemoryLocatorStore::default();

        let first = extract(&browser, &site(), &instruction("gionee smartphone", ".*"), None, &store)
            .await
            .unwrap();
        let lookups_after_calibration = browser.xpath_lookups();

        let cached = store.load("smartphone").unwrap();
        let second = extract(&browser, &site(), &instruction("apple iphone", ".*"), cached, &store)
            .await
            .unwrap();

        assert!(!second.calibrated);
        assert_eq!(second.locators, first.locators);
        assert_eq!(browser.xpath_lookups(), lookups_after_calibration);
        assert_eq!(second.listings.titles, vec!["Apple iPhone 13 (128GB)"]);
    }

    #[tokio::test]
    async fn uncalibrated_keyword_searches_calibration_keyword_first() {
        let browser = FakeBrowser::default()
            .with_page("gionee smartphone", gionee_page())
            .with_page("samsung smartphone", ResultPage::new(&[("SAMSUNG M14 (128GB)", "₹12,490")]));
        let store = MemoryLocatorStore::default();

        let out = extract(&browser, &site(), &instruction("samsung smartphone", ".*"), None, &store)
            .await
            .unwrap();

        assert!(out.calibrated);
        assert_eq!(browser.searches(), vec!["gionee smartphone", "samsung smartphone"]);
        assert_eq!(out.listings.titles, vec!["SAMSUNG M14 (128GB)"]);
    }

    #[tokio::test]
    async fn empty_results_are_element_not_found() {
        let browser = FakeBrowser::default().with_page("gionee smartphone", gionee_page());
        let store = MemoryLocatorStore::default();
        let cached = Some(LocatorSet {
            title_selector: "KzDlHZ".into(),
            price_selector: "Nx9bqj._4b5DiR".into(),
        });

        let err = extract(&browser, &site(), &instruction("nokia", ".*"), cached, &store)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ElementNotFound(_)));
    }

    #[tokio::test]
    async fn recalibrate_overwrites_cache() {
        let browser = FakeBrowser::default().with_page("gionee smartphone", gionee_page());
        let store = MemoryLocatorStore::default();
        let stale = LocatorSet {
            title_selector: "old".into(),
            price_selector: "old".into(),
        };
        store.save("smartphone", &stale).unwrap();

        let set = recalibrate(&browser, &site(), "smartphone", &store).await.unwrap();
        assert_eq!(set.title_selector, "KzDlHZ");
        assert_eq!(store.load("smartphone").unwrap(), Some(set));
    }

    #[test]
    fn count_mismatch_is_malformed() {
        let raw = RawListings {
            titles: vec!["a".into(), "b".into()],
            prices: vec!["₹1".into()],
        };
        assert!(matches!(raw.pairs(), Err(PipelineError::MalformedListing(_))));
        assert!(matches!(raw.validate(), Err(PipelineError::MalformedListing(_))));
    }

    #[test]
    fn unparseable_price_or_blank_title_is_malformed() {
        let bad_price = RawListings {
            titles: vec!["GIONEE Max (64GB)".into()],
            prices: vec!["Coming soon".into()],
        };
        assert!(matches!(bad_price.validate(), Err(PipelineError::MalformedListing(_))));

        let blank_title = RawListings {
            titles: vec!["  ".into()],
            prices: vec!["₹9,999".into()],
        };
        assert!(matches!(blank_title.validate(), Err(PipelineError::MalformedListing(_))));
    }

    #[tokio::test]
    async fn mismatched_render_fails_extraction() {
        let page = ResultPage {
            titles: vec!["GIONEE Max (64GB)".into(), "Other".into()],
            prices: vec!["₹9,999".into()],
        };
        let browser = FakeBrowser::default().with_page("gionee smartphone", page);
        let store = MemoryLocatorStore::default();

        let err = extract(&browser, &site(), &instruction("gionee smartphone", ".*"), None, &store)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedListing(_)));
    }
}
