use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Browser, BrowserError, Element, Form, Locator, Strategy};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) listing_scraper/0.1";

struct Page {
    url: Url,
    html: String,
}

/// Browser capability over plain HTTP for server-rendered pages.
///
/// Waiting for an element re-fetches the current page until it shows up or
/// the wait runs out. Scripts are never executed.
pub struct StaticBrowser {
    client: reqwest::Client,
    page: Mutex<Option<Page>>,
}

impl StaticBrowser {
    pub fn new(page_load_timeout: Duration) -> Result<Self, BrowserError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(page_load_timeout)
            .build()
            .map_err(|e| BrowserError::Navigation {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            page: Mutex::new(None),
        })
    }

    async fn fetch(&self, url: Url) -> Result<Page, BrowserError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| navigation_error(&url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(navigation_error(&url, format!("HTTP {status}")));
        }
        let final_url = response.url().clone();
        let html = response.text().await.map_err(|e| navigation_error(&url, e))?;
        Ok(Page { url: final_url, html })
    }

    async fn load(&self, url: Url) -> Result<(), BrowserError> {
        let page = self.fetch(url).await?;
        *self.page.lock().await = Some(page);
        Ok(())
    }

    async fn snapshot(&self) -> Result<(Url, String), BrowserError> {
        let page = self.page.lock().await;
        let page = page.as_ref().ok_or(BrowserError::NoPage)?;
        Ok((page.url.clone(), page.html.clone()))
    }
}

fn navigation_error(url: &Url, reason: impl ToString) -> BrowserError {
    BrowserError::Navigation {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl Browser for StaticBrowser {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let target = Url::parse(url).map_err(|e| BrowserError::Navigation {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        info!(url = %target, "Navigating");
        self.load(target).await
    }

    async fn locate_all(
        &self,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<Vec<Element>, BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            let (url, html) = self.snapshot().await?;
            let found = select(&html, locator)?;
            if !found.is_empty() {
                debug!(%locator, count = found.len(), "Located elements");
                return Ok(found);
            }
            if Instant::now() + POLL_INTERVAL > deadline {
                return Err(BrowserError::Timeout {
                    locator: locator.clone(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            self.load(url).await?;
        }
    }

    async fn submit_text(&self, element: &Element, text: &str) -> Result<(), BrowserError> {
        let form = element.form.as_ref().ok_or_else(|| {
            BrowserError::Submit(format!("<{}> is not inside a form", element.tag))
        })?;
        let (base, _) = self.snapshot().await?;
        let mut target = match form.action.as_deref().filter(|a| !a.is_empty()) {
            Some(action) => base
                .join(action)
                .map_err(|e| BrowserError::Submit(e.to_string()))?,
            None => base,
        };
        let field = element.attr("name").unwrap_or("q");
        target.query_pairs_mut().clear().append_pair(field, text);
        info!(url = %target, "Submitting search");
        self.load(target).await
    }

    async fn close(&self) {
        self.page.lock().await.take();
        info!("Browser session released");
    }
}

/// Evaluate `locator` against an HTML document.
pub fn select(html: &str, locator: &Locator) -> Result<Vec<Element>, BrowserError> {
    let doc = Html::parse_document(html);
    let selector = locator.selector.trim();
    let matched = match locator.strategy {
        Strategy::XPath => eval_xpath(&doc, selector)?,
        Strategy::LinkText => anchors(&doc)?
            .into_iter()
            .filter(|a| element_text(*a) == selector)
            .collect(),
        Strategy::PartialLinkText => anchors(&doc)?
            .into_iter()
            .filter(|a| element_text(*a).contains(selector))
            .collect(),
        Strategy::Id => css_select(&doc, &format!("[id=\"{}\"]", escape_quotes(selector)))?,
        Strategy::Name => css_select(&doc, &format!("[name=\"{}\"]", escape_quotes(selector)))?,
        Strategy::TagName => css_select(&doc, selector)?,
        Strategy::ClassName => css_select(&doc, &format!(".{}", selector.trim_start_matches('.')))?,
        Strategy::CssSelector => css_select(&doc, selector)?,
    };
    Ok(matched.into_iter().map(to_element).collect())
}

fn css_select<'a>(doc: &'a Html, css: &str) -> Result<Vec<ElementRef<'a>>, BrowserError> {
    let sel = Selector::parse(css)
        .map_err(|e| BrowserError::Unsupported(format!("invalid selector {css:?}: {e}")))?;
    Ok(doc.select(&sel).collect())
}

fn anchors(doc: &Html) -> Result<Vec<ElementRef<'_>>, BrowserError> {
    css_select(doc, "a")
}

fn escape_quotes(s: &str) -> String {
    s.replace('"', "\\\"")
}

/// Absolute paths only: `/html/body/div[1]/a[2]`. Anything else is rejected.
fn eval_xpath<'a>(doc: &'a Html, path: &str) -> Result<Vec<ElementRef<'a>>, BrowserError> {
    let unsupported = || BrowserError::Unsupported(format!("unsupported xpath {path:?}"));
    if !path.starts_with('/') || path.starts_with("//") {
        return Err(unsupported());
    }

    let mut steps = Vec::new();
    for raw in path[1..].split('/') {
        let (tag, index) = match raw.split_once('[') {
            Some((tag, rest)) => {
                let n: usize = rest
                    .strip_suffix(']')
                    .and_then(|n| n.parse().ok())
                    .filter(|n| *n >= 1)
                    .ok_or_else(unsupported)?;
                (tag, n)
            }
            None => (raw, 1),
        };
        if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(unsupported());
        }
        steps.push((tag.to_ascii_lowercase(), index));
    }

    let mut current = doc.root_element();
    match steps.split_first() {
        Some(((tag, 1), _)) if tag == "html" => {}
        _ => return Ok(Vec::new()),
    }
    for (tag, index) in &steps[1..] {
        let next = current
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|c| c.value().name() == tag)
            .nth(index - 1);
        match next {
            Some(el) => current = el,
            None => return Ok(Vec::new()),
        }
    }
    Ok(vec![current])
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn to_element(el: ElementRef<'_>) -> Element {
    let value = el.value();
    let form = el
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| a.value().name() == "form")
        .map(|f| Form {
            action: f.value().attr("action").map(str::to_string),
        });
    Element {
        tag: value.name().to_string(),
        text: element_text(el),
        attributes: value
            .attrs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        form,
    }
}
