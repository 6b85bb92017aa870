//! Progress broadcast hub: per-session fan-out of progress to live subscribers.
//!
//! Each session with an active job or subscriber has one relay task. The relay
//! is the only subscriber of the session's broker channel. It folds every
//! update into the session store and copies it into each registered
//! subscriber queue. A `done` message from the owning job, or a poll that
//! finds the session terminal, makes the relay push the terminal sentinel to
//! every queue and exit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

use crate::session::{SessionStatus, SessionStore, StoreError};

use super::broker::{BrokerError, ProgressBroker};
use super::queue::{QueueItem, SubscriberQueue};
use super::types::{ChannelMessage, ProgressEvent, channel_name};

/// Hub settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Longest single wait of a relay or subscriber before it re-checks status.
    pub poll_interval: Duration,
    /// Bound of each subscriber queue.
    pub subscriber_capacity: usize,
    /// Stage count reported in synthesized terminal events.
    pub total_stages: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            subscriber_capacity: 64,
            total_stages: crate::pipeline::TOTAL_STAGES,
        }
    }
}

/// Hub errors.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Sessions with a relay or at least one subscriber.
    pub session_count: usize,
    pub total_subscribers: usize,
    pub running_relays: usize,
}

#[derive(Default)]
struct HubSession {
    subscribers: HashMap<u64, Arc<SubscriberQueue>>,
    relay: Option<JoinHandle<()>>,
    /// The sentinel has been pushed; late subscribers get it immediately.
    finished: bool,
}

impl HubSession {
    fn relay_running(&self) -> bool {
        self.relay.as_ref().is_some_and(|h| !h.is_finished())
    }
}

struct HubInner {
    sessions: Mutex<HashMap<String, HubSession>>,
    store: Arc<SessionStore>,
    broker: Arc<dyn ProgressBroker>,
    config: HubConfig,
    next_subscriber_id: AtomicU64,
}

/// Registry of relays and subscriber queues, keyed by session.
#[derive(Clone)]
pub struct ProgressHub {
    inner: Arc<HubInner>,
}

impl ProgressHub {
    pub fn new(store: Arc<SessionStore>, broker: Arc<dyn ProgressBroker>, config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: Mutex::new(HashMap::new()),
                store,
                broker,
                config,
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }

    /// Start the session's relay unless one is already running or finished.
    pub async fn ensure_relay(&self, session_id: &str) -> Result<(), HubError> {
        if self.inner.with_session(session_id, |s| s.relay_running() || s.finished) {
            return Ok(());
        }

        // Subscribe before taking the registry lock; it may await on storage.
        let rx = self.inner.broker.subscribe(&channel_name(session_id)).await?;

        let mut sessions = self.inner.lock_sessions();
        let entry = sessions.entry(session_id.to_string()).or_default();
        if entry.relay_running() || entry.finished {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let id = session_id.to_string();
        entry.relay = Some(tokio::spawn(async move {
            inner.run_relay(id, rx).await;
        }));
        drop(sessions);

        debug!(session_id, "Progress relay started");
        Ok(())
    }

    /// Attach a new subscriber to a session.
    ///
    /// A session that is already terminal yields a subscription whose only
    /// event is the terminal one.
    pub async fn subscribe(&self, session_id: &str) -> Result<Subscription, HubError> {
        let session = self.inner.store.get(session_id).await?;
        let queue = Arc::new(SubscriberQueue::new(self.inner.config.subscriber_capacity));
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        let needs_relay = {
            let mut sessions = self.inner.lock_sessions();
            let entry = sessions.entry(session_id.to_string()).or_default();
            entry.subscribers.insert(id, Arc::clone(&queue));
            if entry.finished || session.status.is_terminal() {
                queue.push(QueueItem::Terminal);
                false
            } else {
                !entry.relay_running()
            }
        };

        let subscription = Subscription {
            id,
            session_id: session_id.to_string(),
            queue,
            hub: Arc::clone(&self.inner),
            done: false,
        };

        if needs_relay {
            self.ensure_relay(session_id).await?;
        }

        info!(session_id, subscriber_id = id, "Progress subscriber attached");
        Ok(subscription)
    }

    /// Push the sentinel to every subscriber and stop the relay.
    ///
    /// Used when a session is deleted out from under its subscribers.
    pub fn close(&self, session_id: &str) {
        let relay = {
            let mut sessions = self.inner.lock_sessions();
            let relay = sessions.get_mut(session_id).and_then(|s| s.relay.take());
            self.inner.finish_locked(&mut sessions, session_id);
            relay
        };
        if let Some(handle) = relay {
            handle.abort();
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner.with_session(session_id, |s| s.subscribers.len())
    }

    pub fn stats(&self) -> HubStats {
        let sessions = self.inner.lock_sessions();
        HubStats {
            session_count: sessions.len(),
            total_subscribers: sessions.values().map(|s| s.subscribers.len()).sum(),
            running_relays: sessions.values().filter(|s| s.relay_running()).count(),
        }
    }
}

impl HubInner {
    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, HubSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_session<T: Default>(&self, session_id: &str, f: impl FnOnce(&HubSession) -> T) -> T {
        self.lock_sessions().get(session_id).map(f).unwrap_or_default()
    }

    fn fan_out(&self, session_id: &str, item: &QueueItem) {
        let sessions = self.lock_sessions();
        let Some(entry) = sessions.get(session_id) else {
            return;
        };
        for (id, queue) in &entry.subscribers {
            if queue.push(item.clone()) {
                debug!(session_id, subscriber_id = id, "Subscriber queue full, dropped oldest update");
            }
        }
    }

    fn finish(&self, session_id: &str) {
        let mut sessions = self.lock_sessions();
        self.finish_locked(&mut sessions, session_id);
    }

    fn finish_locked(&self, sessions: &mut HashMap<String, HubSession>, session_id: &str) {
        let entry = sessions.entry(session_id.to_string()).or_default();
        if !entry.finished {
            entry.finished = true;
            for queue in entry.subscribers.values() {
                queue.push(QueueItem::Terminal);
            }
        }
        if entry.subscribers.is_empty() {
            sessions.remove(session_id);
        }
    }

    fn detach(&self, session_id: &str, subscriber_id: u64) {
        let mut sessions = self.lock_sessions();
        if let Some(entry) = sessions.get_mut(session_id)
            && entry.subscribers.remove(&subscriber_id).is_some()
        {
            debug!(session_id, subscriber_id, "Progress subscriber detached");
            if entry.subscribers.is_empty() && (entry.finished || !entry.relay_running()) {
                sessions.remove(session_id);
            }
        }
    }

    /// `true` when the session is terminal or no longer exists.
    async fn session_settled(&self, session_id: &str) -> bool {
        match self.store.get(session_id).await {
            Ok(session) => session.status.is_terminal(),
            Err(StoreError::NotFound { .. }) => true,
            Err(e) => {
                warn!(session_id, error = %e, "Status check failed");
                false
            }
        }
    }

    async fn run_relay(self: Arc<Self>, session_id: String, rx: broadcast::Receiver<String>) {
        let poll = self.config.poll_interval;
        let mut rx = Some(rx);

        loop {
            let received = match rx.as_mut() {
                Some(rx) => tokio::time::timeout(poll, rx.recv()).await,
                None => {
                    tokio::time::sleep(poll).await;
                    Ok(Err(RecvError::Closed))
                }
            };

            match received {
                Ok(Ok(payload)) => match ChannelMessage::decode(&payload) {
                    Ok(ChannelMessage::Progress(update)) => {
                        match self.store.apply_progress(&session_id, &update).await {
                            Ok(_) => {}
                            Err(StoreError::NotFound { .. }) => {
                                self.finish(&session_id);
                                break;
                            }
                            Err(e) => warn!(session_id = %session_id, error = %e, "Failed to apply progress counters"),
                        }
                        self.fan_out(&session_id, &QueueItem::Update(update));
                    }
                    Ok(ChannelMessage::Done) => {
                        debug!(session_id = %session_id, "Done notification received");
                        self.finish(&session_id);
                        break;
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Discarding undecodable progress message");
                    }
                },
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(session_id = %session_id, skipped, "Relay lagged behind broker");
                }
                Ok(Err(RecvError::Closed)) => {
                    rx = None;
                    if self.session_settled(&session_id).await {
                        self.finish(&session_id);
                        break;
                    }
                }
                Err(_elapsed) => {
                    if self.session_settled(&session_id).await {
                        debug!(session_id = %session_id, "Relay found session terminal while idle");
                        self.finish(&session_id);
                        break;
                    }
                }
            }
        }

        debug!(session_id = %session_id, "Progress relay stopped");
    }
}

/// Outcome of one bounded read from a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum RecvOutcome {
    Event(ProgressEvent),
    /// Nothing arrived within the poll interval and the session is still running.
    Idle,
    /// The terminal event has already been delivered.
    Closed,
}

/// One consumer's view of a session's progress.
///
/// Detaches from the hub when dropped.
pub struct Subscription {
    id: u64,
    session_id: String,
    queue: Arc<SubscriberQueue>,
    hub: Arc<HubInner>,
    done: bool,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Read with a wait bounded by the poll interval.
    pub async fn recv(&mut self) -> RecvOutcome {
        if self.done {
            return RecvOutcome::Closed;
        }
        match self.queue.pop(self.hub.config.poll_interval).await {
            Some(QueueItem::Update(update)) => RecvOutcome::Event(ProgressEvent::from_update(&update)),
            Some(QueueItem::Terminal) => RecvOutcome::Event(self.terminal_event().await),
            None => {
                if self.hub.session_settled(&self.session_id).await {
                    RecvOutcome::Event(self.terminal_event().await)
                } else {
                    RecvOutcome::Idle
                }
            }
        }
    }

    /// Next event; `None` after the terminal event has been returned.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.recv().await {
                RecvOutcome::Event(event) => return Some(event),
                RecvOutcome::Idle => {}
                RecvOutcome::Closed => return None,
            }
        }
    }

    /// Stream of events ending with exactly one terminal event.
    pub fn into_stream(mut self) -> impl Stream<Item = ProgressEvent> + Send {
        async_stream::stream! {
            while let Some(event) = self.next_event().await {
                yield event;
            }
        }
    }

    async fn terminal_event(&mut self) -> ProgressEvent {
        self.done = true;
        let total = self.hub.config.total_stages;
        match self.hub.store.get(&self.session_id).await {
            Ok(session) => match session.status {
                SessionStatus::Completed => ProgressEvent::completed(total),
                SessionStatus::Failed => ProgressEvent::failed(
                    total,
                    session
                        .error_message
                        .unwrap_or_else(|| "Processing failed".to_string()),
                ),
                status => ProgressEvent::failed(
                    total,
                    format!("Progress stream closed while session was {status}"),
                ),
            },
            Err(StoreError::NotFound { .. }) => ProgressEvent::failed(total, "Session not found"),
            Err(e) => ProgressEvent::failed(total, e.to_string()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.detach(&self.session_id, self.id);
    }
}
