use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mpb_http::{FetchError, HttpClientConfig, HttpFetcher};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ChatTransport;

/// Server-side long-poll window. Must stay below the HTTP client timeout.
pub const POLL_TIMEOUT_SECS: u64 = 10;

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
}

impl Update {
    /// Chat id and text of a plain text message; everything else is ignored.
    pub fn text_message(&self) -> Option<(i64, &str)> {
        let message = self.message.as_ref()?;
        Some((message.chat.id, message.text.as_deref()?))
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("telegram {method} failed: {description}")]
    Api { method: String, description: String },
}

/// Bot API client. URLs carry the token, so they are only logged redacted.
pub struct TelegramClient {
    http: HttpFetcher,
    api_base: String,
    token: String,
}

impl TelegramClient {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        http: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(http)?,
            api_base: api_base.into(),
            token: token.into(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            self.token,
            method
        )
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, TelegramError> {
        let response: ApiResponse<T> = self.http.post_json(&self.method_url(method), body).await?;
        match response {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse { description, .. } => Err(TelegramError::Api {
                method: method.to_string(),
                description: description.unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }

    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        let mut body = json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.call("getUpdates", &body).await
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        let _: serde_json::Value = self
            .call("sendMessage", &json!({ "chat_id": chat_id, "text": text }))
            .await?;
        Ok(())
    }

    pub async fn set_webhook(&self, url: &str, secret_token: Option<&str>) -> Result<(), TelegramError> {
        let mut body = json!({ "url": url, "allowed_updates": ["message"] });
        if let Some(secret) = secret_token {
            body["secret_token"] = json!(secret);
        }
        let _: bool = self.call("setWebhook", &body).await?;
        info!("webhook registered");
        Ok(())
    }

    pub async fn delete_webhook(&self) -> Result<(), TelegramError> {
        let _: bool = self.call("deleteWebhook", &json!({})).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send_text(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        self.send_message(chat_id, text).await?;
        Ok(())
    }
}

/// Long-polls `getUpdates` and forwards updates until cancelled or the receiver goes away.
pub async fn run_polling(
    client: Arc<TelegramClient>,
    updates: mpsc::Sender<Update>,
    cancel: CancellationToken,
) {
    if let Err(err) = client.delete_webhook().await {
        warn!(error = %err, "could not clear webhook before polling");
    }
    info!("polling for chat updates");

    let mut offset: Option<i64> = None;
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = client.get_updates(offset, POLL_TIMEOUT_SECS) => batch,
        };
        match batch {
            Ok(batch) => {
                for update in batch {
                    offset = Some(update.update_id + 1);
                    if updates.send(update).await.is_err() {
                        debug!("update receiver closed, stopping poller");
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "getUpdates failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    info!("poller stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::extract::{Path, State};
    use axum::routing::post;
    use axum::{Json, Router};
    use mpb_http::BackoffPolicy;
    use serde_json::Value;

    use super::*;

    #[derive(Clone, Default)]
    struct FakeApi {
        calls: Arc<Mutex<Vec<(String, Value)>>>,
    }

    async fn bot_method(
        State(api): State<FakeApi>,
        Path((token, method)): Path<(String, String)>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        api.calls.lock().unwrap().push((method.clone(), body.clone()));
        if token != "bot123:secret" {
            return Json(json!({"ok": false, "description": "Unauthorized"}));
        }
        Json(match method.as_str() {
            "getUpdates" if body.get("offset").is_none() => json!({
                "ok": true,
                "result": [
                    {"update_id": 7, "message": {"message_id": 1, "chat": {"id": 42}, "text": "Poring Card"}},
                    {"update_id": 8, "message": {"message_id": 2, "chat": {"id": 42}}}
                ]
            }),
            "getUpdates" => json!({"ok": true, "result": []}),
            "sendMessage" => json!({"ok": true, "result": {"message_id": 99}}),
            "setWebhook" | "deleteWebhook" => json!({"ok": true, "result": true}),
            _ => json!({"ok": false, "description": "Not Found"}),
        })
    }

    async fn spawn_fake_api() -> (String, FakeApi) {
        let api = FakeApi::default();
        let app = Router::new()
            .route("/{token}/{method}", post(bot_method))
            .with_state(api.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), api)
    }

    fn client(base: &str, token: &str) -> TelegramClient {
        TelegramClient::new(
            base,
            token,
            HttpClientConfig {
                timeout: Duration::from_secs(5),
                user_agent: None,
                backoff: BackoffPolicy::none(),
            },
        )
        .unwrap()
    }

    #[test]
    fn only_text_messages_are_actionable() {
        let update: Update = serde_json::from_value(json!({
            "update_id": 1,
            "message": {"message_id": 3, "chat": {"id": -100}, "text": "/ping"}
        }))
        .unwrap();
        assert_eq!(update.text_message(), Some((-100, "/ping")));

        let sticker: Update = serde_json::from_value(json!({
            "update_id": 2,
            "message": {"message_id": 4, "chat": {"id": 5}, "sticker": {}}
        }))
        .unwrap();
        assert_eq!(sticker.text_message(), None);

        let edited: Update =
            serde_json::from_value(json!({"update_id": 3, "edited_message": {}})).unwrap();
        assert_eq!(edited.text_message(), None);
    }

    #[tokio::test]
    async fn send_message_posts_chat_id_and_text() {
        let (base, api) = spawn_fake_api().await;
        let client = client(&base, "123:secret");
        client.send_message(42, "hello").await.unwrap();

        let calls = api.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "sendMessage");
        assert_eq!(calls[0].1, json!({"chat_id": 42, "text": "hello"}));
    }

    #[tokio::test]
    async fn api_level_failures_carry_the_description() {
        let (base, _api) = spawn_fake_api().await;
        let client = client(&base, "999:wrong");
        match client.send_message(1, "x").await {
            Err(TelegramError::Api { method, description }) => {
                assert_eq!(method, "sendMessage");
                assert_eq!(description, "Unauthorized");
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn poller_forwards_updates_and_advances_the_offset() {
        let (base, api) = spawn_fake_api().await;
        let client = Arc::new(client(&base, "123:secret"));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let poller = tokio::spawn(run_polling(client, tx, cancel.clone()));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.update_id, 7);
        assert_eq!(second.update_id, 8);

        let saw_offset = || {
            api.calls
                .lock()
                .unwrap()
                .iter()
                .any(|(method, body)| method == "getUpdates" && body["offset"] == json!(9))
        };
        for _ in 0..200 {
            if saw_offset() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        poller.await.unwrap();

        assert!(saw_offset());
        assert_eq!(api.calls.lock().unwrap()[0].0, "deleteWebhook");
    }
}
