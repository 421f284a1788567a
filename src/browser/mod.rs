pub mod static_page;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub use static_page::StaticBrowser;

/// Element lookup strategies understood by the browser capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Strategy {
    Id,
    Name,
    XPath,
    LinkText,
    PartialLinkText,
    TagName,
    ClassName,
    CssSelector,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Id => "id",
            Strategy::Name => "name",
            Strategy::XPath => "xpath",
            Strategy::LinkText => "link_text",
            Strategy::PartialLinkText => "partial_link_text",
            Strategy::TagName => "tag_name",
            Strategy::ClassName => "class_name",
            Strategy::CssSelector => "css_selector",
        }
    }
}

impl FromStr for Strategy {
    type Err = BrowserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "id" => Ok(Strategy::Id),
            "name" => Ok(Strategy::Name),
            "xpath" => Ok(Strategy::XPath),
            "link_text" => Ok(Strategy::LinkText),
            "partial_link_text" => Ok(Strategy::PartialLinkText),
            "tag_name" | "tag" => Ok(Strategy::TagName),
            "class_name" | "class" => Ok(Strategy::ClassName),
            "css_selector" | "css" => Ok(Strategy::CssSelector),
            _ => Err(BrowserError::Unsupported(format!("{s} is not a valid locator type"))),
        }
    }
}

impl TryFrom<String> for Strategy {
    type Error = BrowserError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A (strategy, selector) pair identifying DOM elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Locator {
    pub strategy: Strategy,
    pub selector: String,
}

impl Locator {
    pub fn new(strategy: Strategy, selector: impl Into<String>) -> Self {
        Self {
            strategy,
            selector: selector.into(),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.strategy.as_str(), self.selector)
    }
}

/// Owned snapshot of a located element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub tag: String,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
    pub form: Option<Form>,
}

/// The `<form>` enclosing an element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Form {
    pub action: Option<String>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("no element matched {locator} within {waited:?}")]
    Timeout { locator: Locator, waited: Duration },

    #[error("{0}")]
    Unsupported(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("cannot submit text: {0}")]
    Submit(String),

    #[error("no page loaded")]
    NoPage,
}

/// The browser-automation capability the extraction stage drives.
///
/// One session is shared by the whole run and is not safe for concurrent
/// navigation; callers serialize access.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// Wait up to `timeout` for at least one element matching `locator`.
    async fn locate_all(
        &self,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<Vec<Element>, BrowserError>;

    async fn locate_one(&self, locator: &Locator, timeout: Duration) -> Result<Element, BrowserError> {
        self.locate_all(locator, timeout)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BrowserError::Timeout {
                locator: locator.clone(),
                waited: timeout,
            })
    }

    /// Type `text` into `element` and press enter.
    async fn submit_text(&self, element: &Element, text: &str) -> Result<(), BrowserError>;

    /// Release the session. Called exactly once at the end of a run.
    async fn close(&self);
}
