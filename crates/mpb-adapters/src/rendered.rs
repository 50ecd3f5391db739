use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mpb_core::{AveragePrice, ItemMatch, ItemQuery, RawListing};
use scraper::{ElementRef, Html, Selector};
use tokio::time::Instant;
use tracing::debug;

use crate::{join_url, FetchedListings, LookupError, MarketSource, SourceKind, SourceSession};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Css(String),
    XPath(String),
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Self::Css(selector.into())
    }

    pub fn xpath(expression: impl Into<String>) -> Self {
        Self::XPath(expression.into())
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css(s) => write!(f, "css `{s}`"),
            Self::XPath(s) => write!(f, "xpath `{s}`"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll: Duration,
}

impl WaitPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll: Duration::from_millis(250),
        }
    }
}

/// Selectors and timings for the rendered item database.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub search_path: String,
    pub search_input: String,
    pub result_link: String,
    pub shops_button: String,
    pub listing: String,
    pub average_phrase: String,
    pub wait: WaitPolicy,
    /// Listings may legitimately never appear, so this wait is short and non-fatal.
    pub listing_wait: WaitPolicy,
    pub settle: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            search_path: "/db/items".to_string(),
            search_input: "input[placeholder='Filtrar por nome']".to_string(),
            result_link: "a[href^='/db/items/']".to_string(),
            shops_button: "//button[contains(., 'lojas')]".to_string(),
            listing: ".rounded-sm.bg-white.text-black.px-4.py-2.text-base".to_string(),
            average_phrase: "A Média de preço deste item é de".to_string(),
            wait: WaitPolicy::new(Duration::from_secs(10)),
            listing_wait: WaitPolicy::new(Duration::from_secs(3)),
            settle: Duration::from_secs(1),
        }
    }
}

/// Minimal browser surface the rendered strategy needs.
#[async_trait]
pub trait PageDriver: Send {
    async fn goto(&mut self, url: &str) -> Result<(), LookupError>;

    /// `Ok(false)` only when the page reports no match; driver failures are errors.
    async fn exists(&mut self, locator: &Locator) -> Result<bool, LookupError>;

    async fn type_and_submit(&mut self, locator: &Locator, text: &str) -> Result<(), LookupError>;

    /// Scrolls the element into view before clicking it.
    async fn click(&mut self, locator: &Locator) -> Result<(), LookupError>;

    async fn html(&mut self) -> Result<String, LookupError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait DriverLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn PageDriver>, LookupError>;
}

/// Polls until the locator matches or the policy times out. `Ok(false)` on timeout.
pub async fn wait_for_element(
    driver: &mut dyn PageDriver,
    locator: &Locator,
    policy: WaitPolicy,
) -> Result<bool, LookupError> {
    let deadline = Instant::now() + policy.timeout;
    loop {
        if driver.exists(locator).await? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            debug!(%locator, timeout_ms = policy.timeout.as_millis() as u64, "element wait timed out");
            return Ok(false);
        }
        tokio::time::sleep(policy.poll).await;
    }
}

pub struct RenderedPageSource {
    base_url: String,
    config: RenderConfig,
    launcher: Arc<dyn DriverLauncher>,
}

impl RenderedPageSource {
    pub fn new(
        base_url: impl Into<String>,
        config: RenderConfig,
        launcher: Arc<dyn DriverLauncher>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            config,
            launcher,
        }
    }
}

#[async_trait]
impl MarketSource for RenderedPageSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Rendered
    }

    async fn open(&self) -> Result<Box<dyn SourceSession>, LookupError> {
        let driver = self.launcher.launch().await?;
        Ok(Box::new(RenderedSession {
            driver,
            base_url: self.base_url.clone(),
            config: self.config.clone(),
            closed: false,
        }))
    }
}

struct RenderedSession {
    driver: Box<dyn PageDriver>,
    base_url: String,
    config: RenderConfig,
    closed: bool,
}

async fn settle(pause: Duration) {
    if !pause.is_zero() {
        tokio::time::sleep(pause).await;
    }
}

#[async_trait]
impl SourceSession for RenderedSession {
    async fn search(&mut self, query: &ItemQuery) -> Result<ItemMatch, LookupError> {
        let url = join_url(&self.base_url, &self.config.search_path);
        self.driver.goto(&url).await?;
        settle(self.config.settle).await;

        let input = Locator::css(self.config.search_input.as_str());
        if !wait_for_element(self.driver.as_mut(), &input, self.config.wait).await? {
            return Err(LookupError::automation(format!(
                "search field {input} never appeared"
            )));
        }
        self.driver.type_and_submit(&input, &query.raw_name).await?;
        settle(self.config.settle).await;

        let link = Locator::css(self.config.result_link.as_str());
        if !wait_for_element(self.driver.as_mut(), &link, self.config.wait).await? {
            return Err(LookupError::not_found(query));
        }
        let html = self.driver.html().await?;
        extract_first_result(&html, &self.config.result_link)?
            .ok_or_else(|| LookupError::not_found(query))
    }

    async fn fetch_listings(&mut self, item: &ItemMatch) -> Result<FetchedListings, LookupError> {
        let url = join_url(&self.base_url, &item.id);
        self.driver.goto(&url).await?;
        settle(self.config.settle).await;

        let shops = Locator::xpath(self.config.shops_button.as_str());
        if !wait_for_element(self.driver.as_mut(), &shops, self.config.wait).await? {
            return Err(LookupError::automation(format!(
                "shops control {shops} not found on {url}"
            )));
        }

        let html = self.driver.html().await?;
        let average = extract_average(&html, &self.config.average_phrase);
        if average.is_none() {
            debug!(item = %item.canonical_name, "item page shows no average price");
        }

        self.driver.click(&shops).await?;
        settle(self.config.settle).await;

        let listing = Locator::css(self.config.listing.as_str());
        if !wait_for_element(self.driver.as_mut(), &listing, self.config.listing_wait).await? {
            debug!(item = %item.canonical_name, "no shop listings rendered");
        }
        let html = self.driver.html().await?;
        let records = extract_listing_texts(&html, &self.config.listing)?
            .into_iter()
            .map(RawListing::Text)
            .collect();

        Ok(FetchedListings { records, average })
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.driver.close().await;
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, LookupError> {
    Selector::parse(selector)
        .map_err(|e| LookupError::automation(format!("invalid selector {selector:?}: {e}")))
}

fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(node: ElementRef<'_>) -> String {
    node.text().collect::<Vec<_>>().join(" ")
}

/// First result link in document order; its text is the canonical name, its href the id.
pub fn extract_first_result(html: &str, selector: &str) -> Result<Option<ItemMatch>, LookupError> {
    let sel = parse_selector(selector)?;
    let document = Html::parse_document(html);
    Ok(document.select(&sel).find_map(|node| {
        let href = node.value().attr("href")?.trim();
        if href.is_empty() {
            return None;
        }
        let canonical_name = text_or_none(&element_text(node)).unwrap_or_else(|| href.to_string());
        Some(ItemMatch {
            canonical_name,
            id: href.to_string(),
        })
    }))
}

/// Finds the `div` whose own text carries `phrase` and reads the number that follows it.
pub fn extract_average(html: &str, phrase: &str) -> Option<AveragePrice> {
    let sel = Selector::parse("div").ok()?;
    let document = Html::parse_document(html);
    document
        .select(&sel)
        .filter(|div| {
            div.children()
                .filter_map(|child| child.value().as_text())
                .any(|text| {
                    let own: &str = &text.text;
                    own.contains(phrase)
                })
        })
        .find_map(|div| {
            let full = element_text(div);
            let (_, rest) = full.split_once(phrase)?;
            AveragePrice::from_sentence(rest)
        })
}

pub fn extract_listing_texts(html: &str, selector: &str) -> Result<Vec<String>, LookupError> {
    let sel = parse_selector(selector)?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&sel)
        .filter_map(|node| text_or_none(&element_text(node)))
        .collect())
}
