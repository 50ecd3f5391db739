use async_trait::async_trait;
use mpb_core::{AveragePrice, ItemMatch, ItemQuery, RawListing, StructuredListing};
use mpb_http::{HttpClientConfig, HttpFetcher};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{join_url, FetchedListings, LookupError, MarketSource, SourceKind, SourceSession};

/// Endpoint templates relative to the base URL. `{id}` is replaced by the item id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiPaths {
    pub search: String,
    pub detail: String,
    pub shops: String,
}

impl Default for ApiPaths {
    fn default() -> Self {
        Self {
            search: "/api/items".to_string(),
            detail: "/api/items/{id}".to_string(),
            shops: "/api/items/{id}/shops".to_string(),
        }
    }
}

impl ApiPaths {
    fn expand(template: &str, id: &str) -> String {
        template.replace("{id}", id)
    }
}

#[derive(Debug, Clone)]
pub struct ApiSource {
    base_url: String,
    paths: ApiPaths,
    http: HttpClientConfig,
}

impl ApiSource {
    pub fn new(base_url: impl Into<String>, paths: ApiPaths, http: HttpClientConfig) -> Self {
        Self {
            base_url: base_url.into(),
            paths,
            http,
        }
    }
}

#[async_trait]
impl MarketSource for ApiSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn open(&self) -> Result<Box<dyn SourceSession>, LookupError> {
        let http = HttpFetcher::new(self.http.clone())
            .map_err(|err| LookupError::session(format!("{err:#}")))?;
        Ok(Box::new(ApiSession {
            http: Some(http),
            base_url: self.base_url.clone(),
            paths: self.paths.clone(),
        }))
    }
}

struct ApiSession {
    http: Option<HttpFetcher>,
    base_url: String,
    paths: ApiPaths,
}

impl ApiSession {
    fn http(&self) -> Result<&HttpFetcher, LookupError> {
        self.http
            .as_ref()
            .ok_or_else(|| LookupError::session("api session already closed"))
    }

    fn item_url(&self, template: &str, id: &str) -> String {
        join_url(&self.base_url, &ApiPaths::expand(template, id))
    }
}

#[async_trait]
impl SourceSession for ApiSession {
    async fn search(&mut self, query: &ItemQuery) -> Result<ItemMatch, LookupError> {
        let url = join_url(&self.base_url, &self.paths.search);
        let body: JsonValue = self
            .http()?
            .get_json(&url, &[("name", query.raw_name.as_str())])
            .await?;

        let entries = data_array(&body, "search")?;
        let Some(first) = entries.first() else {
            return Err(LookupError::not_found(query));
        };

        let id = first
            .get("id")
            .and_then(json_id)
            .ok_or_else(|| LookupError::schema("search result without an id"))?;
        let canonical_name = first
            .get("name")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| LookupError::schema("search result without a name"))?
            .to_string();

        Ok(ItemMatch { canonical_name, id })
    }

    async fn fetch_listings(&mut self, item: &ItemMatch) -> Result<FetchedListings, LookupError> {
        let detail_url = self.item_url(&self.paths.detail, &item.id);
        let detail: JsonValue = self.http()?.get_json(&detail_url, &[]).await?;
        let data = detail
            .get("data")
            .filter(|value| value.is_object())
            .ok_or_else(|| LookupError::schema("item detail without a `data` object"))?;
        let average = data
            .get("market")
            .and_then(|market| market.get("average_price"))
            .and_then(AveragePrice::from_json);

        let shops_url = self.item_url(&self.paths.shops, &item.id);
        let shops: JsonValue = self.http()?.get_json(&shops_url, &[]).await?;
        let records = data_array(&shops, "shops")?
            .iter()
            .map(|entry| RawListing::Structured(structured_listing(entry)))
            .collect();

        Ok(FetchedListings { records, average })
    }

    async fn close(&mut self) {
        self.http.take();
    }
}

fn data_array<'a>(body: &'a JsonValue, endpoint: &str) -> Result<&'a Vec<JsonValue>, LookupError> {
    body.get("data")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| LookupError::schema(format!("{endpoint} response without a `data` array")))
}

fn json_id(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn structured_listing(entry: &JsonValue) -> StructuredListing {
    StructuredListing {
        price: entry.get("price").cloned(),
        x: coordinate(entry, "x"),
        y: coordinate(entry, "y"),
        map: match entry.get("map") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(map)) if !map.trim().is_empty() => Some(map.trim().to_string()),
            Some(other) => {
                debug!(map = %other, "ignoring unusable shop map");
                None
            }
        },
    }
}

/// Integer or integer-valued string; anything else drops the coordinate.
fn coordinate(entry: &JsonValue, field: &str) -> Option<i64> {
    let value = entry.get(field)?;
    let parsed = match value {
        JsonValue::Null => return None,
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    if parsed.is_none() {
        debug!(field, value = %value, "ignoring unusable shop coordinate");
    }
    parsed
}
