//! Bounded single-consumer queue that never blocks the producer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use super::types::ProgressUpdate;

/// Item delivered to one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QueueItem {
    Update(ProgressUpdate),
    /// No further items will follow.
    Terminal,
}

/// Per-subscriber queue. When full, the oldest unread item is dropped.
pub(crate) struct SubscriberQueue {
    items: Mutex<VecDeque<QueueItem>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without waiting. Returns `true` if an older item was evicted.
    pub(crate) fn push(&self, item: QueueItem) -> bool {
        let evicted = {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            if items.back() == Some(&QueueItem::Terminal) {
                return false;
            }
            let evicted = if items.len() >= self.capacity {
                items.pop_front();
                true
            } else {
                false
            };
            items.push_back(item);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    fn try_pop(&self) -> Option<QueueItem> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Dequeue, waiting at most `wait` for an item.
    pub(crate) async fn pop(&self, wait: Duration) -> Option<QueueItem> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_pop();
            }
        }
    }

    /// Number of items evicted so far.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
