use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use mpb_adapters::{
    ApiPaths, LaunchProfile, MarketConfig, RenderConfig, SourceKind, WaitPolicy, DEFAULT_BASE_URL,
};
use mpb_guard::DEFAULT_LOCK_PATH;
use mpb_http::{BackoffPolicy, HttpClientConfig};

pub const DEFAULT_TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub bot_token: Option<String>,
    pub port: u16,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub is_container: bool,
    pub headless: bool,
    pub source: SourceKind,
    pub market_base_url: String,
    pub lock_path: PathBuf,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub render_timeout: Duration,
    pub render_settle: Duration,
    pub chrome_bin: Option<PathBuf>,
    pub telegram_api_base: String,
}

impl BotConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`BotConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let is_container = parse_bool(&lookup, "IS_CONTAINER", false);
        let source = match non_empty(&lookup, "MARKET_SOURCE") {
            Some(raw) => raw
                .parse::<SourceKind>()
                .with_context(|| format!("Invalid MARKET_SOURCE: {raw}"))?,
            None => SourceKind::Api,
        };
        let port = parse_number::<u16, _>(&lookup, "PORT", 8080)?;

        Ok(Self {
            bot_token: non_empty(&lookup, "BOT_TOKEN"),
            port,
            webhook_url: non_empty(&lookup, "WEBHOOK_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            webhook_secret: non_empty(&lookup, "WEBHOOK_SECRET"),
            is_container,
            headless: parse_bool(&lookup, "MPB_HEADLESS", is_container),
            source,
            market_base_url: non_empty(&lookup, "MARKET_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            lock_path: non_empty(&lookup, "MPB_LOCK_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCK_PATH)),
            http_timeout: Duration::from_secs(parse_number(&lookup, "MPB_HTTP_TIMEOUT_SECS", 20)?),
            user_agent: non_empty(&lookup, "MPB_USER_AGENT")
                .unwrap_or_else(|| "mpb-bot/0.1".to_string()),
            render_timeout: Duration::from_millis(parse_number(
                &lookup,
                "MPB_RENDER_TIMEOUT_MS",
                10_000,
            )?),
            render_settle: Duration::from_millis(parse_number(
                &lookup,
                "MPB_RENDER_SETTLE_MS",
                1_000,
            )?),
            chrome_bin: non_empty(&lookup, "CHROME_BIN").map(PathBuf::from),
            telegram_api_base: non_empty(&lookup, "TELEGRAM_API_BASE")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API.to_string()),
        })
    }

    pub fn require_token(&self) -> Result<&str> {
        self.bot_token
            .as_deref()
            .ok_or_else(|| anyhow!("BOT_TOKEN must be set to run the bot"))
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn market_config(&self) -> MarketConfig {
        let launch = LaunchProfile {
            container: self.is_container,
            headless: self.headless,
            chrome_bin: self.chrome_bin.clone(),
            ..LaunchProfile::default()
        };
        MarketConfig {
            base_url: self.market_base_url.clone(),
            http: self.http_config(),
            api: ApiPaths::default(),
            render: RenderConfig {
                wait: WaitPolicy::new(self.render_timeout),
                settle: self.render_settle,
                ..RenderConfig::default()
            },
            launch,
        }
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"))
        .unwrap_or(default)
}

fn parse_number<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + ToString,
    F: Fn(&str) -> Option<String>,
{
    let raw = non_empty(lookup, key).unwrap_or_else(|| default.to_string());
    raw.parse::<T>()
        .map_err(|_| anyhow!("Invalid {key}: {raw} (expected integer)"))
}
