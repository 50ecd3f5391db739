//! Chat-facing side of MPB: configuration, price lookups, command handling,
//! Telegram delivery and the per-chat dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mpb_adapters::{lookup_with, LookupError, MarketSource};
use mpb_core::{
    fetch_error_reply, format_reply, not_found_reply, resolve, ItemQuery, LookupOutcome,
};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod dispatch;
mod telegram;

pub use config::{BotConfig, DEFAULT_TELEGRAM_API};
pub use dispatch::{Dispatcher, DispatcherConfig};
pub use telegram::{
    run_polling, Chat, Message, TelegramClient, TelegramError, Update, POLL_TIMEOUT_SECS,
};

pub const CRATE_NAME: &str = "mpb-bot";

pub const WELCOME_TEXT: &str =
    "👋 Send me an item name and I will find the cheapest offer on the Ragnatales market!";
pub const PING_REPLY: &str = "✅ Bot is online and working!";
pub const SEARCHING_TEXT: &str = "🔎 Searching...";

/// Outbound side of the chat platform.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> anyhow::Result<()>;
}

/// Runs lookups against the one configured source and turns them into replies.
#[derive(Clone)]
pub struct PriceLookup {
    source: Arc<dyn MarketSource>,
}

impl PriceLookup {
    pub fn new(source: Arc<dyn MarketSource>) -> Self {
        Self { source }
    }

    pub async fn lookup(&self, query: &ItemQuery) -> Result<LookupOutcome, LookupError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("lookup", %request_id, query = %query.raw_name);
        async {
            let started_at = Utc::now();
            let snapshot = lookup_with(self.source.as_ref(), query).await?;
            let summary = resolve(&snapshot.records, snapshot.average.clone());
            let outcome = LookupOutcome {
                request_id,
                query: query.clone(),
                matched: snapshot.item,
                started_at,
                finished_at: Utc::now(),
                considered_records: snapshot.records.len(),
                summary,
            };
            info!(
                item = %outcome.matched.canonical_name,
                records = outcome.considered_records,
                listed = outcome.summary.is_listed(),
                elapsed_ms = (outcome.finished_at - outcome.started_at).num_milliseconds(),
                "lookup finished"
            );
            Ok::<_, LookupError>(outcome)
        }
        .instrument(span)
        .await
    }

    /// Reply text for one query. Failures never leak error details to the user.
    pub async fn reply_for(&self, query: &ItemQuery) -> String {
        let item = query.raw_name.as_str();
        match self.lookup(query).await {
            Ok(outcome) => format_reply(item, &outcome.summary),
            Err(LookupError::NotFound { .. }) => {
                info!(query = item, "item not found on the market");
                not_found_reply(item)
            }
            Err(err @ LookupError::Fetch(_)) => {
                error!(query = item, error = ?anyhow::Error::from(err), "market lookup failed");
                fetch_error_reply(item)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Start,
    Ping,
    Query(ItemQuery),
    Ignored,
}

/// `/start` and `/ping` (optionally addressed as `/cmd@BotName`) are commands;
/// other slash commands and blank text are ignored; anything else is an item query.
pub fn classify(text: &str) -> Incoming {
    let trimmed = text.trim();
    if let Some(command) = trimmed.strip_prefix('/') {
        let name = command
            .split_whitespace()
            .next()
            .unwrap_or("")
            .split('@')
            .next()
            .unwrap_or("");
        return match name.to_ascii_lowercase().as_str() {
            "start" => Incoming::Start,
            "ping" => Incoming::Ping,
            _ => Incoming::Ignored,
        };
    }
    ItemQuery::new(trimmed).map_or(Incoming::Ignored, Incoming::Query)
}

pub struct BotHandler {
    lookup: PriceLookup,
    transport: Arc<dyn ChatTransport>,
}

impl BotHandler {
    pub fn new(lookup: PriceLookup, transport: Arc<dyn ChatTransport>) -> Self {
        Self { lookup, transport }
    }

    pub async fn handle(&self, chat_id: i64, text: &str) {
        match classify(text) {
            Incoming::Start => self.send(chat_id, WELCOME_TEXT).await,
            Incoming::Ping => self.send(chat_id, PING_REPLY).await,
            Incoming::Query(query) => {
                self.send(chat_id, SEARCHING_TEXT).await;
                let reply = self.lookup.reply_for(&query).await;
                self.send(chat_id, &reply).await;
            }
            Incoming::Ignored => {}
        }
    }

    async fn send(&self, chat_id: i64, text: &str) {
        if let Err(err) = self.transport.send_text(chat_id, text).await {
            warn!(chat_id, error = %err, "failed to deliver chat message");
        }
    }
}
