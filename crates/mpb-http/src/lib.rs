//! HTTP fetch utilities (timeouts, retry classification, capped backoff) for MPB.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "mpb-http";

const ERROR_DETAIL_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}: {detail}")]
    HttpStatus {
        status: u16,
        url: String,
        detail: String,
    },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Owns one reqwest client; dropping the fetcher releases its connections.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET with retries on transport failures, 5xx and 429.
    pub async fn get_bytes(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = "GET", url = %redact_url(url));
        async {
            let mut attempt = 0usize;
            loop {
                match self.client.get(url).query(query).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = redact_url(resp.url().as_str());

                        if status.is_success() {
                            let body = resp
                                .bytes()
                                .await
                                .map_err(|source| FetchError::Request {
                                    url: final_url.clone(),
                                    source,
                                })?
                                .to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(status = status.as_u16(), attempt, "retrying after status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        let detail = resp.text().await.unwrap_or_default();
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                            detail: truncate_detail(detail),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(error = %err, attempt, "retrying after transport error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request {
                            url: redact_url(url),
                            source: err.without_url(),
                        });
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let resp = self.get_bytes(url, query).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url,
            source,
        })
    }

    /// POST is sent once; callers decide whether a repeat is safe.
    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let redacted = redact_url(url);
        let span = info_span!("http_fetch", method = "POST", url = %redacted);
        async {
            let resp = self
                .client
                .post(url)
                .json(body)
                .send()
                .await
                .map_err(|err| FetchError::Request {
                    url: redacted.clone(),
                    source: err.without_url(),
                })?;
            let status = resp.status();
            let bytes = resp.bytes().await.map_err(|err| FetchError::Request {
                url: redacted.clone(),
                source: err.without_url(),
            })?;
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: redacted.clone(),
                    detail: truncate_detail(String::from_utf8_lossy(&bytes).into_owned()),
                });
            }
            serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                url: redacted.clone(),
                source,
            })
        }
        .instrument(span)
        .await
    }
}

/// Hides bot credentials embedded in URL paths (`/bot<id>:<secret>/...`).
pub fn redact_url(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    let mut rest = url;
    while let Some(idx) = rest.find("/bot") {
        let (head, tail) = rest.split_at(idx + 4);
        out.push_str(head);
        let end = tail.find(['/', '?']).unwrap_or(tail.len());
        let segment = &tail[..end];
        if segment.contains(':') {
            out.push_str("<redacted>");
        } else {
            out.push_str(segment);
        }
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}

fn truncate_detail(mut detail: String) -> String {
    if detail.len() > ERROR_DETAIL_LIMIT {
        let mut cut = ERROR_DETAIL_LIMIT;
        while !detail.is_char_boundary(cut) {
            cut -= 1;
        }
        detail.truncate(cut);
    }
    detail
}
