//! Core price model, listing normalizer and cheapest-listing resolver for MPB.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mpb-core";

/// Map name used when a structured listing carries coordinates but no map.
pub const DEFAULT_MAP: &str = "market";

static PRICE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([\d.]+,\d{2}|\d{1,3}(?:\.\d{3})+)\b").expect("price token regex")
});

static LOCATION_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@market (\d+)/(\d+)").expect("location token regex"));

static AVERAGE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d[\d.,]*").expect("average token regex"));

/// One normalized sell offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub price: Decimal,
    pub location: Option<String>,
}

/// Listing as produced by a source, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawListing {
    /// Display text of a rendered listing element.
    Text(String),
    /// Record decoded from the JSON API.
    Structured(StructuredListing),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructuredListing {
    pub price: Option<JsonValue>,
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub map: Option<String>,
}

/// User-supplied search term, trimmed and guaranteed non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemQuery {
    pub raw_name: String,
}

impl ItemQuery {
    pub fn new(raw_name: &str) -> Option<Self> {
        let trimmed = raw_name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self {
                raw_name: trimmed.to_string(),
            })
        }
    }
}

/// First search hit a source returned for a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMatch {
    pub canonical_name: String,
    pub id: String,
}

/// Marketplace-reported average, kept exactly as the source displayed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AveragePrice(String);

impl AveragePrice {
    pub fn new(text: impl Into<String>) -> Option<Self> {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Pulls the first numeric run out of a sentence such as
    /// `"A Média de preço deste item é de 1.250.000 zenys."`.
    pub fn from_sentence(text: &str) -> Option<Self> {
        let token = AVERAGE_TOKEN.find(text)?.as_str();
        Self::new(token.trim_end_matches(['.', ',']))
    }

    /// Strings pass through, numbers use their JSON rendering, anything else is absent.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(s) => Self::new(s.as_str()),
            JsonValue::Number(n) => Self::new(n.to_string()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AveragePrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PriceSummary {
    pub lowest: Option<Listing>,
    pub average: Option<AveragePrice>,
}

impl PriceSummary {
    pub fn is_listed(&self) -> bool {
        self.lowest.is_some()
    }
}

/// One finished lookup, as recorded in the operational log.
#[derive(Debug, Clone, Serialize)]
pub struct LookupOutcome {
    pub request_id: Uuid,
    pub query: ItemQuery,
    pub matched: ItemMatch,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub considered_records: usize,
    pub summary: PriceSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no price token in {0:?}")]
    NoPriceToken(String),
    #[error("price {0:?} is not a number")]
    InvalidPrice(String),
    #[error("listing has no price")]
    MissingPrice,
    #[error("negative price {0}")]
    NegativePrice(Decimal),
}

pub fn normalize(raw: &RawListing) -> Result<Listing, ParseError> {
    match raw {
        RawListing::Text(text) => normalize_text(text),
        RawListing::Structured(record) => normalize_structured(record),
    }
}

pub fn normalize_text(text: &str) -> Result<Listing, ParseError> {
    let token = PRICE_TOKEN
        .captures(text)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| ParseError::NoPriceToken(text.to_string()))?;
    let price = parse_price_token(token.as_str())?;
    let location = LOCATION_TOKEN
        .captures(text)
        .map(|caps| format!("@market {}/{}", &caps[1], &caps[2]));
    Ok(Listing { price, location })
}

/// `1.234,56` -> `1234.56`, `2.000` -> `2000`.
pub fn parse_price_token(token: &str) -> Result<Decimal, ParseError> {
    let cleaned = token.replace('.', "").replace(',', ".");
    Decimal::from_str(&cleaned).map_err(|_| ParseError::InvalidPrice(token.to_string()))
}

pub fn normalize_structured(record: &StructuredListing) -> Result<Listing, ParseError> {
    let price = match record.price.as_ref() {
        None | Some(JsonValue::Null) => return Err(ParseError::MissingPrice),
        Some(JsonValue::Number(n)) => {
            let repr = n.to_string();
            Decimal::from_str(&repr)
                .or_else(|_| Decimal::from_scientific(&repr))
                .map_err(|_| ParseError::InvalidPrice(repr))?
        }
        // Strings follow the listing-text grammar, so `2.000` is two thousand.
        Some(JsonValue::String(s)) => match normalize_text(s) {
            Ok(listing) => listing.price,
            Err(_) => Decimal::from_str(s.trim()).map_err(|_| ParseError::InvalidPrice(s.clone()))?,
        },
        Some(other) => return Err(ParseError::InvalidPrice(other.to_string())),
    };
    if price.is_sign_negative() && !price.is_zero() {
        return Err(ParseError::NegativePrice(price));
    }
    let location = match (record.x, record.y) {
        (Some(x), Some(y)) => Some(format!(
            "@{} {}/{}",
            record.map.as_deref().unwrap_or(DEFAULT_MAP),
            x,
            y
        )),
        _ => None,
    };
    Ok(Listing { price, location })
}

/// Cheapest listing wins; on equal prices the first one seen is kept.
pub fn resolve(raw_records: &[RawListing], average: Option<AveragePrice>) -> PriceSummary {
    let mut lowest: Option<Listing> = None;
    for (index, raw) in raw_records.iter().enumerate() {
        match normalize(raw) {
            Ok(listing) => {
                let cheaper = lowest
                    .as_ref()
                    .map_or(true, |current| listing.price < current.price);
                if cheaper {
                    lowest = Some(listing);
                }
            }
            Err(err) => debug!(index, error = %err, "skipping unparsable listing"),
        }
    }
    PriceSummary { lowest, average }
}

/// Integer part only, truncated, grouped with `.` every three digits.
pub fn format_price(price: Decimal) -> String {
    let integral = price.trunc().abs().to_string();
    let digits = integral.split('.').next().unwrap_or("0");
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(ch);
    }
    out
}

pub fn not_found_reply(item_name: &str) -> String {
    format!("❌ The item '{item_name}' is not listed on the market.")
}

pub fn fetch_error_reply(item_name: &str) -> String {
    format!("❌ Could not look up '{item_name}' right now. Please try again.")
}

pub fn format_reply(item_name: &str, summary: &PriceSummary) -> String {
    let mut reply = match &summary.lowest {
        Some(listing) => format!(
            "🛒 The cheapest {} costs {} zeny and is at {}.",
            item_name,
            format_price(listing.price),
            listing.location.as_deref().unwrap_or("")
        ),
        None => not_found_reply(item_name),
    };
    if let Some(average) = &summary.average {
        reply.push_str(&format!("\n📊 Average price for this item: {average} zeny."));
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(s: &str) -> RawListing {
        RawListing::Text(s.to_string())
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn comma_decimal_and_grouped_integer_tokens_normalize() {
        assert_eq!(normalize_text("1.234,56").unwrap().price, dec("1234.56"));
        assert_eq!(normalize_text("2.000").unwrap().price, dec("2000"));
        assert_eq!(normalize_text("Vende por 300,00 z").unwrap().price, dec("300"));
        assert_eq!(normalize_text("12.345.678 zeny").unwrap().price, dec("12345678"));
    }

    #[test]
    fn location_is_optional() {
        let with = normalize_text("150,50 zeny @market 3/4").unwrap();
        assert_eq!(with.location.as_deref(), Some("@market 3/4"));
        let without = normalize_text("150,50 zeny").unwrap();
        assert_eq!(without.location, None);
    }

    #[test]
    fn text_without_price_token_is_a_parse_error() {
        assert!(matches!(normalize_text("sold out"), Err(ParseError::NoPriceToken(_))));
        assert!(matches!(normalize_text("500 zeny"), Err(ParseError::NoPriceToken(_))));
    }

    #[test]
    fn structured_listing_uses_numeric_price_and_coordinates() {
        let listing = normalize_structured(&StructuredListing {
            price: Some(json!(1500.5)),
            x: Some(150),
            y: Some(98),
            map: None,
        })
        .unwrap();
        assert_eq!(listing.price, dec("1500.5"));
        assert_eq!(listing.location.as_deref(), Some("@market 150/98"));

        let partial = normalize_structured(&StructuredListing {
            price: Some(json!("2500")),
            x: Some(1),
            y: None,
            map: Some("prontera".into()),
        })
        .unwrap();
        assert_eq!(partial.price, dec("2500"));
        assert_eq!(partial.location, None);
    }

    #[test]
    fn structured_string_prices_use_the_listing_grammar() {
        let price = |value: JsonValue| {
            normalize_structured(&StructuredListing {
                price: Some(value),
                ..Default::default()
            })
            .map(|listing| listing.price)
        };
        assert_eq!(price(json!("2.000")), Ok(dec("2000")));
        assert_eq!(price(json!("150,50")), Ok(dec("150.50")));
        assert_eq!(price(json!("1.234,56")), Ok(dec("1234.56")));
        assert_eq!(price(json!(" 875 ")), Ok(dec("875")));
        assert!(matches!(price(json!("cheap")), Err(ParseError::InvalidPrice(_))));

        let structured = |value: &str| {
            RawListing::Structured(StructuredListing {
                price: Some(json!(value)),
                ..Default::default()
            })
        };
        let summary = resolve(&[structured("2.000"), structured("150,50")], None);
        assert_eq!(summary.lowest.unwrap().price, dec("150.50"));
    }

    #[test]
    fn structured_listing_rejects_missing_or_bad_price() {
        let missing = StructuredListing::default();
        assert_eq!(normalize_structured(&missing), Err(ParseError::MissingPrice));
        let bad = StructuredListing {
            price: Some(json!({"amount": 1})),
            ..Default::default()
        };
        assert!(matches!(normalize_structured(&bad), Err(ParseError::InvalidPrice(_))));
        let negative = StructuredListing {
            price: Some(json!(-5)),
            ..Default::default()
        };
        assert!(matches!(normalize_structured(&negative), Err(ParseError::NegativePrice(_))));
    }

    #[test]
    fn resolve_empty_has_no_lowest() {
        let summary = resolve(&[], None);
        assert_eq!(summary.lowest, None);
        assert!(!summary.is_listed());
    }

    #[test]
    fn resolve_keeps_first_seen_on_ties() {
        let records = vec![
            text("500,00"),
            text("300,00 @market 1/1"),
            text("300,00 @market 2/2"),
        ];
        let summary = resolve(&records, None);
        let lowest = summary.lowest.unwrap();
        assert_eq!(lowest.price, dec("300"));
        assert_eq!(lowest.location.as_deref(), Some("@market 1/1"));
    }

    #[test]
    fn resolve_skips_bad_records_without_blanking_others() {
        let records = vec![
            text("no price here"),
            RawListing::Structured(StructuredListing::default()),
            text("1.000 @market 9/9"),
        ];
        let summary = resolve(&records, AveragePrice::new("900"));
        assert_eq!(summary.lowest.unwrap().price, dec("1000"));
        assert_eq!(summary.average.unwrap().as_str(), "900");
    }

    #[test]
    fn price_is_truncated_and_grouped() {
        assert_eq!(format_price(dec("12345")), "12.345");
        assert_eq!(format_price(dec("12345.99")), "12.345");
        assert_eq!(format_price(dec("999")), "999");
        assert_eq!(format_price(dec("1000000")), "1.000.000");
        assert_eq!(format_price(dec("0.5")), "0");
    }

    #[test]
    fn reply_includes_average_line_only_when_present() {
        let summary = PriceSummary {
            lowest: Some(Listing {
                price: dec("150.5"),
                location: Some("@market 3/4".into()),
            }),
            average: AveragePrice::new("200"),
        };
        let reply = format_reply("Poring Card", &summary);
        assert_eq!(
            reply,
            "🛒 The cheapest Poring Card costs 150 zeny and is at @market 3/4.\n📊 Average price for this item: 200 zeny."
        );

        let bare = PriceSummary {
            lowest: Some(Listing {
                price: dec("10"),
                location: None,
            }),
            average: None,
        };
        assert_eq!(
            format_reply("Jellopy", &bare),
            "🛒 The cheapest Jellopy costs 10 zeny and is at ."
        );
    }

    #[test]
    fn unlisted_item_still_reports_average() {
        let summary = PriceSummary {
            lowest: None,
            average: AveragePrice::new("1.250"),
        };
        let reply = format_reply("Elunium", &summary);
        assert!(reply.starts_with(&not_found_reply("Elunium")));
        assert!(reply.ends_with("Average price for this item: 1.250 zeny."));
    }

    #[test]
    fn average_is_pulled_from_sentence_and_json() {
        let avg = AveragePrice::from_sentence("A Média de preço deste item é de 1.250.000 zenys.").unwrap();
        assert_eq!(avg.as_str(), "1.250.000");
        assert_eq!(AveragePrice::from_json(&json!(200)).unwrap().as_str(), "200");
        assert_eq!(AveragePrice::from_json(&json!("3.500")).unwrap().as_str(), "3.500");
        assert_eq!(AveragePrice::from_json(&json!(null)), None);
    }

    #[test]
    fn item_query_is_trimmed_and_non_empty() {
        assert_eq!(ItemQuery::new("  Poring Card ").unwrap().raw_name, "Poring Card");
        assert!(ItemQuery::new("   ").is_none());
    }
}
