//! Market source contracts plus the JSON API and rendered-page implementations.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use mpb_core::{AveragePrice, ItemMatch, ItemQuery, RawListing};
use mpb_http::{FetchError, HttpClientConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

mod api;
mod chromium;
mod rendered;

pub use api::{ApiPaths, ApiSource};
pub use chromium::{ChromiumLauncher, LaunchProfile, CONTAINER_CHROME};
pub use rendered::{
    extract_average, extract_first_result, extract_listing_texts, wait_for_element,
    DriverLauncher, Locator, PageDriver, RenderConfig, RenderedPageSource, WaitPolicy,
};

pub const CRATE_NAME: &str = "mpb-adapters";

pub const DEFAULT_BASE_URL: &str = "https://ragnatales.com.br";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Api,
    Rendered,
}

#[derive(Debug, Error)]
#[error("unknown market source {0:?} (expected `api` or `rendered`)")]
pub struct UnknownSourceKind(pub String);

impl FromStr for SourceKind {
    type Err = UnknownSourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" | "json" => Ok(Self::Api),
            "rendered" | "page" | "browser" => Ok(Self::Rendered),
            other => Err(UnknownSourceKind(other.to_string())),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Api => "api",
            Self::Rendered => "rendered",
        })
    }
}

/// Why a request-level fetch failed. Never shown to chat users.
#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("unexpected response shape: {0}")]
    Schema(String),
    #[error("page automation failed: {0}")]
    Automation(String),
    #[error("could not open source session: {0}")]
    Session(String),
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no marketplace match for {query:?}")]
    NotFound { query: String },
    #[error(transparent)]
    Fetch(#[from] FetchFailure),
}

impl LookupError {
    pub fn not_found(query: &ItemQuery) -> Self {
        Self::NotFound {
            query: query.raw_name.clone(),
        }
    }

    pub fn schema(detail: impl Into<String>) -> Self {
        Self::Fetch(FetchFailure::Schema(detail.into()))
    }

    pub fn automation(detail: impl Into<String>) -> Self {
        Self::Fetch(FetchFailure::Automation(detail.into()))
    }

    pub fn session(detail: impl Into<String>) -> Self {
        Self::Fetch(FetchFailure::Session(detail.into()))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<FetchError> for LookupError {
    fn from(err: FetchError) -> Self {
        Self::Fetch(FetchFailure::Http(err))
    }
}

/// Raw listings plus the optional average for one matched item.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchedListings {
    pub records: Vec<RawListing>,
    pub average: Option<AveragePrice>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub item: ItemMatch,
    pub records: Vec<RawListing>,
    pub average: Option<AveragePrice>,
}

/// Factory for per-request sessions. Sessions are never shared between requests.
#[async_trait]
pub trait MarketSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn open(&self) -> Result<Box<dyn SourceSession>, LookupError>;
}

#[async_trait]
pub trait SourceSession: Send {
    async fn search(&mut self, query: &ItemQuery) -> Result<ItemMatch, LookupError>;

    async fn fetch_listings(&mut self, item: &ItemMatch) -> Result<FetchedListings, LookupError>;

    /// Releases the browser or HTTP client. Must be safe to call more than once.
    async fn close(&mut self);
}

/// Opens a session, runs search + fetch and closes the session on every path.
pub async fn lookup_with(
    source: &dyn MarketSource,
    query: &ItemQuery,
) -> Result<MarketSnapshot, LookupError> {
    let mut session = source.open().await?;
    let result = run_session(session.as_mut(), query).await;
    session.close().await;
    match &result {
        Ok(snapshot) => info!(
            source = %source.kind(),
            item = %snapshot.item.canonical_name,
            records = snapshot.records.len(),
            has_average = snapshot.average.is_some(),
            "fetched market listings"
        ),
        Err(err) => debug!(source = %source.kind(), error = %err, "market lookup failed"),
    }
    result
}

async fn run_session(
    session: &mut dyn SourceSession,
    query: &ItemQuery,
) -> Result<MarketSnapshot, LookupError> {
    let item = session.search(query).await?;
    let fetched = session.fetch_listings(&item).await?;
    Ok(MarketSnapshot {
        item,
        records: fetched.records,
        average: fetched.average,
    })
}

#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub base_url: String,
    pub http: HttpClientConfig,
    pub api: ApiPaths,
    pub render: RenderConfig,
    pub launch: LaunchProfile,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            http: HttpClientConfig::default(),
            api: ApiPaths::default(),
            render: RenderConfig::default(),
            launch: LaunchProfile::default(),
        }
    }
}

/// Picks the one strategy used for every lookup of this process.
pub fn source_for(kind: SourceKind, config: &MarketConfig) -> Box<dyn MarketSource> {
    match kind {
        SourceKind::Api => Box::new(ApiSource::new(
            config.base_url.clone(),
            config.api.clone(),
            config.http.clone(),
        )),
        SourceKind::Rendered => Box::new(RenderedPageSource::new(
            config.base_url.clone(),
            config.render.clone(),
            std::sync::Arc::new(ChromiumLauncher::new(config.launch.clone())),
        )),
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
