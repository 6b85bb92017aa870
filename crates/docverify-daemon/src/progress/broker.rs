//! Publish/subscribe transport for per-session progress channels.
//!
//! Two implementations:
//! - [`LocalBroker`]: in-process `tokio::sync::broadcast` channels.
//! - [`DbBroker`]: rows appended to the shared `SQLite` database and polled by
//!   subscribers, so a worker in another process can publish to relays here.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::BoxFuture;
use crate::storage::{Database, DatabaseError};

/// Capacity of the broadcast channel behind every subscription.
const SUBSCRIPTION_CAPACITY: usize = 256;

/// Broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Publish/subscribe channel abstraction.
///
/// Payloads are opaque strings; ordering is preserved per channel.
pub trait ProgressBroker: Send + Sync {
    /// Publish `payload` on `channel`.
    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Receive everything published on `channel` from now on.
    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
    ) -> BoxFuture<'a, Result<broadcast::Receiver<String>, BrokerError>>;

    /// Forget a channel and anything still buffered for it.
    fn purge<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), BrokerError>>;
}

/// In-process broker.
#[derive(Default)]
pub struct LocalBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_CAPACITY).0)
            .clone()
    }
}

impl ProgressBroker for LocalBroker {
    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let tx = self.sender(channel);
            match tx.send(payload) {
                Ok(receivers) => debug!(channel, receivers, "Published progress message"),
                Err(_) => debug!(channel, "No subscribers for progress message"),
            }
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
    ) -> BoxFuture<'a, Result<broadcast::Receiver<String>, BrokerError>> {
        Box::pin(async move { Ok(self.sender(channel).subscribe()) })
    }

    fn purge<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            self.channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(channel);
            Ok(())
        })
    }
}

/// Database-backed broker.
///
/// `publish` appends a row; each subscription runs a poller that forwards new
/// rows in id order and stops once every receiver has been dropped.
pub struct DbBroker {
    db: Database,
    poll_interval: Duration,
}

impl DbBroker {
    pub const fn new(db: Database, poll_interval: Duration) -> Self {
        Self { db, poll_interval }
    }
}

impl ProgressBroker for DbBroker {
    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let id = self.db.append_progress_message(channel, &payload).await?;
            debug!(channel, message_id = id, "Buffered progress message");
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
    ) -> BoxFuture<'a, Result<broadcast::Receiver<String>, BrokerError>> {
        Box::pin(async move {
            let mut last_id = self.db.latest_progress_message_id(channel).await?;
            let (tx, rx) = broadcast::channel(SUBSCRIPTION_CAPACITY);
            let db = self.db.clone();
            let channel = channel.to_string();
            let poll_interval = self.poll_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if tx.receiver_count() == 0 {
                        debug!(channel = %channel, "Progress poller stopped, no receivers");
                        break;
                    }
                    match db.progress_messages_after(&channel, last_id).await {
                        Ok(rows) => {
                            for row in rows {
                                last_id = row.id;
                                let _ = tx.send(row.payload);
                            }
                        }
                        Err(e) => warn!(channel = %channel, error = %e, "Progress poll failed"),
                    }
                }
            });

            Ok(rx)
        })
    }

    fn purge<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let removed = self.db.delete_progress_messages(channel).await?;
            debug!(channel, removed, "Purged progress messages");
            Ok(())
        })
    }
}
