//! Job queue: submit units of work, get opaque handles, revoke best-effort.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::BoxFuture;

/// Opaque reference to a submitted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<JobHandle> for String {
    fn from(h: JobHandle) -> Self {
        h.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work. It receives the token that `revoke` cancels and is
/// expected to check it at its own boundaries.
pub type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// Job queue contract.
pub trait JobQueue: Send + Sync {
    /// Schedule `job` and return its handle.
    fn submit(&self, job: Job) -> JobHandle;

    /// Ask the job to stop. Best-effort: running work only stops at its next
    /// cancellation check. Returns `false` if the handle is unknown or done.
    fn revoke(&self, handle: &JobHandle) -> bool;

    /// Whether the job is still queued or running.
    fn is_active(&self, handle: &JobHandle) -> bool;
}

/// Job queue running each job as a task on the current tokio runtime.
#[derive(Default, Clone)]
pub struct LocalJobQueue {
    jobs: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl LocalJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs submitted and not yet finished.
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a finished job from the registry, including on panic.
struct Deregister {
    jobs: Arc<Mutex<HashMap<String, CancellationToken>>>,
    id: String,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl JobQueue for LocalJobQueue {
    fn submit(&self, job: Job) -> JobHandle {
        let id = uuid::Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        self.lock().insert(id.clone(), token.clone());

        let deregister = Deregister {
            jobs: Arc::clone(&self.jobs),
            id: id.clone(),
        };
        tokio::spawn(async move {
            let _deregister = deregister;
            job(token).await;
        });

        debug!(job_id = %id, "Job submitted");
        JobHandle(id)
    }

    fn revoke(&self, handle: &JobHandle) -> bool {
        let token = self.lock().get(handle.as_str()).cloned();
        token.is_some_and(|token| {
            token.cancel();
            debug!(job_id = %handle, "Job revoked");
            true
        })
    }

    fn is_active(&self, handle: &JobHandle) -> bool {
        self.lock().contains_key(handle.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn submitted_job_runs_and_deregisters() {
        let queue = LocalJobQueue::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = queue.submit(Box::new(move |_token| {
            Box::pin(async move {
                let _ = tx.send(42);
            })
        }));

        assert_eq!(rx.await.unwrap(), 42);
        tokio::time::timeout(Duration::from_secs(1), async {
            while queue.is_active(&handle) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(queue.active_count(), 0);
    }

    #[tokio::test]
    async fn revoke_cancels_token() {
        let queue = LocalJobQueue::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = queue.submit(Box::new(move |token| {
            Box::pin(async move {
                token.cancelled().await;
                let _ = tx.send("stopped");
            })
        }));

        assert!(queue.is_active(&handle));
        assert!(queue.revoke(&handle));
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), rx)
                .await
                .unwrap()
                .unwrap(),
            "stopped"
        );
    }

    #[tokio::test]
    async fn revoke_unknown_handle_is_false() {
        let queue = LocalJobQueue::new();
        assert!(!queue.revoke(&JobHandle::from("nope".to_string())));
    }
}
