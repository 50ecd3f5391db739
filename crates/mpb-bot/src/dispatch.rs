use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{BotHandler, Update};

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Pending messages allowed per chat before new ones are dropped.
    pub queue_depth: usize,
    /// A chat worker with nothing to do for this long exits; the next message respawns it.
    pub idle_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_depth: 16,
            idle_timeout: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Routes updates to one sequential worker per chat.
///
/// Messages from the same chat are answered in arrival order; different chats
/// proceed concurrently. A running lookup is never interrupted by a newer
/// message, only by shutdown.
pub struct Dispatcher {
    handler: Arc<BotHandler>,
    config: DispatcherConfig,
    cancel: CancellationToken,
    workers: HashMap<i64, mpsc::Sender<String>>,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    pub fn new(handler: Arc<BotHandler>, config: DispatcherConfig, cancel: CancellationToken) -> Self {
        Self {
            handler,
            config,
            cancel,
            workers: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Consumes updates until the channel closes or the token is cancelled.
    pub async fn run(mut self, mut updates: mpsc::Receiver<Update>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => self.dispatch(update),
                    None => break,
                },
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => self.prune_idle(),
            }
        }
        self.shutdown().await;
    }

    pub fn dispatch(&mut self, update: Update) {
        let Some((chat_id, text)) = update.text_message() else {
            debug!(update_id = update.update_id, "ignoring non-text update");
            return;
        };
        let mut text = text.to_string();

        if let Some(sender) = self.workers.get(&chat_id) {
            match sender.try_send(text) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    warn!(chat_id, "chat queue full, dropping message");
                    return;
                }
                Err(TrySendError::Closed(returned)) => {
                    debug!(chat_id, "chat worker went idle, respawning");
                    self.workers.remove(&chat_id);
                    text = returned;
                }
            }
        }

        let sender = self.spawn_worker(chat_id);
        if sender.try_send(text).is_err() {
            warn!(chat_id, "fresh chat worker rejected message");
        }
        self.workers.insert(chat_id, sender);
    }

    fn spawn_worker(&mut self, chat_id: i64) -> mpsc::Sender<String> {
        let (tx, mut rx) = mpsc::channel::<String>(self.config.queue_depth.max(1));
        let handler = self.handler.clone();
        let cancel = self.cancel.clone();
        let idle = self.config.idle_timeout;
        self.tasks.spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = tokio::time::timeout(idle, rx.recv()) => next,
                };
                match next {
                    Ok(Some(text)) => handler.handle(chat_id, &text).await,
                    Ok(None) => break,
                    Err(_) => {
                        // Refuse new messages first, then answer any that slipped in.
                        rx.close();
                        while let Ok(text) = rx.try_recv() {
                            handler.handle(chat_id, &text).await;
                        }
                        debug!(chat_id, "chat worker idle, exiting");
                        break;
                    }
                }
            }
        });
        tx
    }

    /// Chats that currently have a live worker.
    pub fn active_chats(&self) -> usize {
        self.workers.len()
    }

    fn prune_idle(&mut self) {
        self.workers.retain(|_, sender| !sender.is_closed());
    }

    /// Stops accepting work and waits (bounded) for in-flight replies.
    pub async fn shutdown(mut self) {
        self.workers.clear();
        let pending = self.tasks.len();
        if pending > 0 {
            info!(pending, "waiting for chat workers to finish");
        }
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("chat workers did not finish in time, aborting");
            self.tasks.abort_all();
        }
    }
}
