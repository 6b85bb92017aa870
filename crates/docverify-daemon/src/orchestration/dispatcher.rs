//! Bounded task dispatcher.
//!
//! `start` registers at most one job per session and records its handle. The
//! job waits for a pool slot, runs the pipeline under a wall-clock deadline,
//! retries only on timeout, and finally writes the terminal status under the
//! session lock before publishing `done` on the session channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use docverify_core::config::{DispatchConfig, PipelineConfig};
use docverify_core::db::unix_timestamp;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pipeline::{AnalysisResult, PipelineError, PipelineJob, PipelineRunner, ProgressEmitter};
use crate::progress::{ChannelMessage, HubError, ProgressBroker, ProgressHub, ProgressUpdate, channel_name};
use crate::session::{SessionStatus, SessionStore, StoreError, upload_dir};

use super::job_queue::{Job, JobHandle, JobQueue};
use super::pool::PipelinePool;

/// How long a finished attempt waits for its queued progress to be published.
const PROGRESS_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Wall-clock deadline of one pipeline attempt.
    pub attempt_timeout: Duration,
    /// Attempts in total, including the first.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub progress_capacity: usize,
    /// Root under which each session's upload directory lives.
    pub sessions_root: PathBuf,
    /// How often a running job refreshes its session lease.
    pub heartbeat_interval: Duration,
    /// Age after which an unrefreshed lease counts as abandoned.
    pub lease_ttl: Duration,
}

impl DispatchSettings {
    pub fn new(dispatch: &DispatchConfig, pipeline: &PipelineConfig, sessions_root: PathBuf) -> Self {
        Self {
            attempt_timeout: Duration::from_secs(dispatch.attempt_timeout_secs),
            max_attempts: dispatch.max_attempts.max(1),
            retry_base_delay: Duration::from_millis(dispatch.retry_base_delay_ms),
            progress_capacity: pipeline.progress_channel_capacity,
            sessions_root,
            heartbeat_interval: Duration::from_secs(dispatch.heartbeat_interval_secs.max(1)),
            lease_ttl: Duration::from_secs(dispatch.lease_ttl_secs.max(1)),
        }
    }
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor)
}

/// Dispatcher errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was revoked and the session marked failed.
    Cancelled,
    /// The session was not processing.
    NoActiveJob,
}

struct DispatcherInner {
    store: Arc<SessionStore>,
    hub: ProgressHub,
    broker: Arc<dyn ProgressBroker>,
    queue: Arc<dyn JobQueue>,
    pool: Arc<PipelinePool>,
    runner: Arc<dyn PipelineRunner>,
    settings: DispatchSettings,
    /// Owner id written to the lease of every job this dispatcher runs.
    worker_id: String,
}

/// Starts, retries and cancels pipeline jobs against a shared pool.
#[derive(Clone)]
pub struct TaskDispatcher {
    inner: Arc<DispatcherInner>,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<SessionStore>,
        hub: ProgressHub,
        broker: Arc<dyn ProgressBroker>,
        queue: Arc<dyn JobQueue>,
        pool: Arc<PipelinePool>,
        runner: Arc<dyn PipelineRunner>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                store,
                hub,
                broker,
                queue,
                pool,
                runner,
                settings,
                worker_id: uuid::Uuid::new_v4().to_string(),
            }),
        }
    }

    /// Lease owner id of this dispatcher's jobs.
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.inner.settings
    }

    pub fn pool(&self) -> &PipelinePool {
        &self.inner.pool
    }

    pub fn queue(&self) -> &dyn JobQueue {
        self.inner.queue.as_ref()
    }

    /// Start processing a session, or return the handle of its running job.
    pub async fn start(&self, session_id: &str) -> Result<JobHandle, DispatchError> {
        let inner = &self.inner;
        let guard = inner.store.lock(session_id).await;
        let mut session = inner.store.get(session_id).await?;

        if session.status == SessionStatus::Processing
            && let Some(handle) = &session.job_handle
        {
            debug!(session_id, job_id = %handle, "Job already running");
            return Ok(JobHandle::from(handle.clone()));
        }
        if session.status.is_terminal() {
            return Err(StoreError::Terminal {
                session_id: session_id.to_string(),
                status: session.status,
            }
            .into());
        }

        // The relay must be listening before the job can publish anything.
        inner.hub.ensure_relay(session_id).await?;
        // Claimed before the status flips so no one sees an unleased job.
        inner
            .store
            .db()
            .claim_lease(session_id, &inner.worker_id, unix_timestamp())
            .await
            .map_err(StoreError::Database)?;

        let job_inner = Arc::clone(inner);
        let id = session_id.to_string();
        let job: Job = Box::new(move |cancel| Box::pin(async move { job_inner.run_job(id, cancel).await }));
        let handle = inner.queue.submit(job);

        session.status = SessionStatus::Processing;
        session.job_handle = Some(handle.to_string());
        session.error_message = None;
        if let Err(e) = inner.store.update(&session).await {
            inner.queue.revoke(&handle);
            inner.release_lease(session_id).await;
            return Err(e.into());
        }
        drop(guard);

        info!(session_id, job_id = %handle, "Job submitted");
        Ok(handle)
    }

    /// Revoke the session's job and mark it failed.
    ///
    /// Agent threads that are already running are not interrupted; their
    /// output is discarded because the session is terminal by then.
    pub async fn cancel(&self, session_id: &str) -> Result<CancelOutcome, DispatchError> {
        let inner = &self.inner;
        let guard = inner.store.lock(session_id).await;
        let session = inner.store.get(session_id).await?;
        if session.status != SessionStatus::Processing {
            return Ok(CancelOutcome::NoActiveJob);
        }

        if let Some(handle) = &session.job_handle {
            let revoked = inner.queue.revoke(&JobHandle::from(handle.clone()));
            debug!(session_id, job_id = %handle, revoked, "Revocation requested");
        }

        let message = PipelineError::Cancelled.to_string();
        let written = inner
            .store
            .modify_locked(session_id, |s| {
                if s.status != SessionStatus::Processing {
                    return false;
                }
                s.status = SessionStatus::Failed;
                s.error_message = Some(message.clone());
                s.job_handle = None;
                true
            })
            .await?;
        drop(guard);

        if written.is_none() {
            return Ok(CancelOutcome::NoActiveJob);
        }
        info!(session_id, "Job cancelled");
        publish_done(inner.broker.as_ref(), session_id).await;
        Ok(CancelOutcome::Cancelled)
    }
}

impl DispatcherInner {
    async fn run_job(&self, session_id: String, cancel: CancellationToken) {
        let started = Instant::now();
        let mut used = 0;
        let outcome = tokio::select! {
            outcome = self.attempts(&session_id, &cancel, &mut used) => outcome,
            () = self.keep_lease(&session_id) => {
                cancel.cancel();
                Err(PipelineError::Unexpected("job lease was taken over by another worker".into()))
            }
        };
        self.finalize(&session_id, outcome, started, used).await;
        self.release_lease(&session_id).await;
    }

    /// Refresh the lease until it is lost. Never returns while this worker owns it.
    async fn keep_lease(&self, session_id: &str) {
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self
                .store
                .db()
                .renew_lease(session_id, &self.worker_id, unix_timestamp())
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(session_id, worker_id = %self.worker_id, "Job lease lost");
                    return;
                }
                Err(e) => warn!(session_id, error = %e, "Failed to renew job lease"),
            }
        }
    }

    async fn release_lease(&self, session_id: &str) {
        if let Err(e) = self.store.db().release_lease(session_id, &self.worker_id).await {
            warn!(session_id, error = %e, "Failed to release job lease");
        }
    }

    /// Run attempts until one finishes or the budget runs out. `used` counts
    /// attempts that acquired a permit.
    async fn attempts(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        used: &mut u32,
    ) -> Result<AnalysisResult, PipelineError> {
        let limit = self.settings.attempt_timeout;
        let max_attempts = self.settings.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let permit = tokio::select! {
                () = cancel.cancelled() => return Err(PipelineError::Cancelled),
                permit = self.pool.acquire() => permit.map_err(|e| PipelineError::Unexpected(e.to_string()))?,
            };
            *used = attempt;
            info!(session_id, attempt, max_attempts, "Pipeline attempt started");

            let attempt_cancel = cancel.child_token();
            let (progress, rx) = ProgressEmitter::channel(self.settings.progress_capacity);
            let mut forwarder = tokio::spawn(forward_progress(
                Arc::clone(&self.broker),
                session_id.to_string(),
                rx,
            ));
            let job = PipelineJob {
                session_id: session_id.to_string(),
                input_dir: upload_dir(&self.settings.sessions_root, session_id),
                progress,
                cancel: attempt_cancel.clone(),
            };

            let run = tokio::time::timeout(limit, self.runner.run(job)).await;
            drop(permit);
            if run.is_err() {
                attempt_cancel.cancel();
            }
            if tokio::time::timeout(PROGRESS_DRAIN_TIMEOUT, &mut forwarder).await.is_err() {
                warn!(session_id, "Progress forwarder did not drain in time");
                forwarder.abort();
            }

            match run {
                Ok(outcome) => return outcome,
                Err(_) => {
                    warn!(session_id, attempt, timeout_secs = limit.as_secs(), "Pipeline attempt timed out");
                    if attempt < max_attempts {
                        let delay = retry_delay(self.settings.retry_base_delay, attempt);
                        debug!(session_id, delay_ms = delay.as_millis(), "Retrying after backoff");
                        #[cfg(feature = "metrics")]
                        docverify_core::metrics::record_retry();
                        tokio::select! {
                            () = cancel.cancelled() => return Err(PipelineError::Cancelled),
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        Err(PipelineError::Timeout {
            limit,
            attempts: max_attempts,
        })
    }

    /// Write the terminal status, unless the session already left `Processing`.
    async fn finalize(
        &self,
        session_id: &str,
        outcome: Result<AnalysisResult, PipelineError>,
        started: Instant,
        attempts: u32,
    ) {
        let guard = self.store.lock(session_id).await;
        match self.store.get(session_id).await {
            Ok(s) if s.status == SessionStatus::Processing => {}
            Ok(s) => {
                debug!(session_id, status = %s.status, "Session already settled, discarding outcome");
                return;
            }
            Err(e) => {
                error!(session_id, error = %e, "Cannot finalize session");
                return;
            }
        }

        let failure = match outcome {
            Ok(result) => self.save_result(session_id, &result).await.err(),
            Err(e) => Some(e.to_string()),
        };

        let written = self
            .store
            .modify_locked(session_id, |s| {
                if s.status != SessionStatus::Processing {
                    return false;
                }
                s.job_handle = None;
                if let Some(message) = &failure {
                    s.status = SessionStatus::Failed;
                    s.error_message = Some(message.clone());
                } else {
                    s.status = SessionStatus::Completed;
                    s.result_available = true;
                    s.progress_percentage = 100.0;
                    s.error_message = None;
                }
                true
            })
            .await;
        drop(guard);

        match written {
            Ok(Some(session)) => {
                info!(
                    session_id,
                    status = %session.status,
                    error = session.error_message.as_deref().unwrap_or(""),
                    attempts,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Session finalized"
                );
                #[cfg(feature = "metrics")]
                docverify_core::metrics::record_job_finished(session.status.as_str(), started.elapsed(), attempts);
                publish_done(self.broker.as_ref(), session_id).await;
            }
            Ok(None) => debug!(session_id, "Session settled concurrently"),
            Err(e) => error!(session_id, error = %e, "Failed to write terminal status"),
        }
    }

    async fn save_result(&self, session_id: &str, result: &AnalysisResult) -> Result<(), String> {
        let json = result
            .to_json()
            .map_err(|e| format!("Failed to serialize result: {e}"))?;
        self.store
            .db()
            .save_result(session_id, &json)
            .await
            .map_err(|e| format!("Failed to store result: {e}"))
    }
}

/// Publish each pipeline update on the session channel until the pipeline drops its sender.
async fn forward_progress(
    broker: Arc<dyn ProgressBroker>,
    session_id: String,
    mut rx: mpsc::Receiver<ProgressUpdate>,
) {
    let channel = channel_name(&session_id);
    while let Some(update) = rx.recv().await {
        match ChannelMessage::Progress(update).encode() {
            Ok(payload) => {
                if let Err(e) = broker.publish(&channel, payload).await {
                    warn!(session_id = %session_id, error = %e, "Failed to publish progress");
                }
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "Failed to encode progress"),
        }
    }
}

async fn publish_done(broker: &dyn ProgressBroker, session_id: &str) {
    let payload = match ChannelMessage::Done.encode() {
        Ok(p) => p,
        Err(e) => {
            warn!(session_id, error = %e, "Failed to encode done message");
            return;
        }
    };
    if let Err(e) = broker.publish(&channel_name(session_id), payload).await {
        warn!(session_id, error = %e, "Failed to publish done message");
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use crate::BoxFuture;
    use crate::orchestration::LocalJobQueue;
    use crate::pipeline::ProcessingMetadata;
    use crate::progress::{HubConfig, LocalBroker};
    use crate::session::Session;
    use crate::storage::Database;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed(Duration),
        Fail,
        Hang,
        WaitForCancel,
        /// Never looks at the token and succeeds after the delay.
        IgnoreCancel(Duration),
    }

    #[derive(Default)]
    struct Counters {
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    struct FakeRunner {
        behavior: Behavior,
        counters: Arc<Counters>,
    }

    fn sample_result() -> AnalysisResult {
        AnalysisResult {
            applicant_name: Some("Jane Doe".into()),
            identity: None,
            financial: None,
            academic: None,
            cross_validation: None,
            completeness: Vec::new(),
            agent_errors: BTreeMap::new(),
            metadata: ProcessingMetadata::default(),
        }
    }

    impl PipelineRunner for FakeRunner {
        fn run(&self, job: PipelineJob) -> BoxFuture<'static, Result<AnalysisResult, PipelineError>> {
            let behavior = self.behavior;
            let counters = Arc::clone(&self.counters);
            Box::pin(async move {
                counters.calls.fetch_add(1, Ordering::SeqCst);
                let now = counters.running.fetch_add(1, Ordering::SeqCst) + 1;
                counters.max_running.fetch_max(now, Ordering::SeqCst);
                let outcome = match behavior {
                    Behavior::Succeed(delay) => {
                        tokio::time::sleep(delay).await;
                        Ok(sample_result())
                    }
                    Behavior::Fail => Err(PipelineError::Scan("input directory missing".into())),
                    Behavior::Hang => {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(sample_result())
                    }
                    Behavior::WaitForCancel => {
                        job.cancel.cancelled().await;
                        Err(PipelineError::Cancelled)
                    }
                    Behavior::IgnoreCancel(delay) => {
                        tokio::time::sleep(delay).await;
                        Ok(sample_result())
                    }
                };
                counters.running.fetch_sub(1, Ordering::SeqCst);
                outcome
            })
        }
    }

    struct Fixture {
        store: Arc<SessionStore>,
        dispatcher: TaskDispatcher,
        counters: Arc<Counters>,
    }

    async fn fixture(behavior: Behavior, pool_size: usize, settings: DispatchSettings) -> Fixture {
        let store = Arc::new(SessionStore::new(Database::open_in_memory().await.unwrap()));
        let broker: Arc<dyn ProgressBroker> = Arc::new(LocalBroker::new());
        let hub = ProgressHub::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            HubConfig {
                poll_interval: Duration::from_millis(50),
                ..HubConfig::default()
            },
        );
        let counters = Arc::new(Counters::default());
        let runner = Arc::new(FakeRunner {
            behavior,
            counters: Arc::clone(&counters),
        });
        let dispatcher = TaskDispatcher::new(
            Arc::clone(&store),
            hub,
            broker,
            Arc::new(LocalJobQueue::new()),
            Arc::new(PipelinePool::new(pool_size)),
            runner,
            settings,
        );
        Fixture {
            store,
            dispatcher,
            counters,
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            attempt_timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(10),
            progress_capacity: 16,
            sessions_root: std::env::temp_dir(),
            heartbeat_interval: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(60),
        }
    }

    async fn wait_terminal(store: &SessionStore, id: &str) -> Session {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let session = store.get(id).await.unwrap();
                if session.status.is_terminal() {
                    return session;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session did not settle")
    }

    #[test]
    fn retry_delay_doubles() {
        let base = Duration::from_secs(2);
        assert_eq!(retry_delay(base, 1), Duration::from_secs(2));
        assert_eq!(retry_delay(base, 2), Duration::from_secs(4));
        assert_eq!(retry_delay(base, 3), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn success_completes_and_stores_result() {
        let f = fixture(Behavior::Succeed(Duration::from_millis(5)), 2, settings()).await;
        let session = f.store.create(None).await.unwrap();

        f.dispatcher.start(&session.id).await.unwrap();
        let done = wait_terminal(&f.store, &session.id).await;

        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.result_available);
        assert!(done.job_handle.is_none());
        let row = f.store.db().get_result(&session.id).await.unwrap();
        let stored = AnalysisResult::from_json(&row.result_json).unwrap();
        assert_eq!(stored.applicant_name.as_deref(), Some("Jane Doe"));
    }

    #[tokio::test]
    async fn second_start_returns_same_handle() {
        let f = fixture(Behavior::WaitForCancel, 2, settings()).await;
        let session = f.store.create(None).await.unwrap();

        let first = f.dispatcher.start(&session.id).await.unwrap();
        let second = f.dispatcher.start(&session.id).await.unwrap();
        assert_eq!(first, second);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.counters.calls.load(Ordering::SeqCst), 1);

        assert_eq!(f.dispatcher.cancel(&session.id).await.unwrap(), CancelOutcome::Cancelled);
        let done = wait_terminal(&f.store, &session.id).await;
        assert_eq!(done.status, SessionStatus::Failed);
        assert_eq!(done.error_message.as_deref(), Some("cancelled by user"));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_pool() {
        let f = fixture(Behavior::Succeed(Duration::from_millis(40)), 2, settings()).await;
        let mut ids = Vec::new();
        for _ in 0..5 {
            let session = f.store.create(Some("batch")).await.unwrap();
            f.dispatcher.start(&session.id).await.unwrap();
            ids.push(session.id);
        }
        for id in &ids {
            assert_eq!(wait_terminal(&f.store, id).await.status, SessionStatus::Completed);
        }
        assert!(f.counters.max_running.load(Ordering::SeqCst) <= 2);
        assert!(f.dispatcher.pool().peak() <= 2);
        assert_eq!(f.counters.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn timeout_is_retried_with_backoff() {
        let s = DispatchSettings {
            attempt_timeout: Duration::from_millis(30),
            retry_base_delay: Duration::from_millis(40),
            ..settings()
        };
        let f = fixture(Behavior::Hang, 1, s).await;
        let session = f.store.create(None).await.unwrap();

        let started = Instant::now();
        f.dispatcher.start(&session.id).await.unwrap();
        let done = wait_terminal(&f.store, &session.id).await;

        assert_eq!(f.counters.calls.load(Ordering::SeqCst), 3);
        // Three attempts plus delays of 40ms and 80ms.
        assert!(started.elapsed() >= Duration::from_millis(3 * 30 + 40 + 80));
        assert_eq!(done.status, SessionStatus::Failed);
        assert!(done.error_message.unwrap().contains("3 attempts"));
    }

    #[tokio::test]
    async fn non_timeout_failure_is_not_retried() {
        let f = fixture(Behavior::Fail, 1, settings()).await;
        let session = f.store.create(None).await.unwrap();

        f.dispatcher.start(&session.id).await.unwrap();
        let done = wait_terminal(&f.store, &session.id).await;

        assert_eq!(f.counters.calls.load(Ordering::SeqCst), 1);
        assert_eq!(done.status, SessionStatus::Failed);
        assert_eq!(
            done.error_message.as_deref(),
            Some("Document scan failed: input directory missing")
        );
        assert!(!done.result_available);
    }

    #[tokio::test]
    async fn cancel_without_job_is_noop() {
        let f = fixture(Behavior::Fail, 1, settings()).await;
        let session = f.store.create(None).await.unwrap();
        assert_eq!(f.dispatcher.cancel(&session.id).await.unwrap(), CancelOutcome::NoActiveJob);
        assert_eq!(f.store.get(&session.id).await.unwrap().status, SessionStatus::Created);
    }

    #[tokio::test]
    async fn terminal_session_cannot_start() {
        let f = fixture(Behavior::Fail, 1, settings()).await;
        let session = f.store.create(None).await.unwrap();
        f.dispatcher.start(&session.id).await.unwrap();
        wait_terminal(&f.store, &session.id).await;

        let err = f.dispatcher.start(&session.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::Store(StoreError::Terminal { .. })));
    }

    async fn wait_inactive(dispatcher: &TaskDispatcher, handle: &JobHandle) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while dispatcher.queue().is_active(handle) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job task did not exit");
    }

    #[tokio::test]
    async fn uncooperative_runner_output_is_discarded_after_cancel() {
        let f = fixture(Behavior::IgnoreCancel(Duration::from_millis(200)), 1, settings()).await;
        let session = f.store.create(None).await.unwrap();

        let handle = f.dispatcher.start(&session.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.dispatcher.cancel(&session.id).await.unwrap(), CancelOutcome::Cancelled);

        // The runner still finishes with a result; the job must throw it away.
        wait_inactive(&f.dispatcher, &handle).await;
        assert_eq!(f.counters.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.counters.running.load(Ordering::SeqCst), 0);

        let done = f.store.get(&session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Failed);
        assert_eq!(done.error_message.as_deref(), Some("cancelled by user"));
        assert!(!done.result_available);
        assert!(matches!(
            f.store.db().get_result(&session.id).await,
            Err(crate::storage::DatabaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn running_job_holds_fresh_lease() {
        let s = DispatchSettings {
            heartbeat_interval: Duration::from_millis(20),
            ..settings()
        };
        let f = fixture(Behavior::WaitForCancel, 1, s).await;
        let session = f.store.create(None).await.unwrap();

        let handle = f.dispatcher.start(&session.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let db = f.store.db();
        assert!(db.renew_lease(&session.id, f.dispatcher.worker_id(), unix_timestamp()).await.unwrap());
        assert!(!db.renew_lease(&session.id, "someone-else", unix_timestamp()).await.unwrap());
        let orphaned = db.list_orphaned_sessions(unix_timestamp() - 60).await.unwrap();
        assert!(orphaned.is_empty(), "live job reported orphaned: {orphaned:?}");

        f.dispatcher.cancel(&session.id).await.unwrap();
        wait_inactive(&f.dispatcher, &handle).await;
        // Released on exit.
        assert!(!db.renew_lease(&session.id, f.dispatcher.worker_id(), unix_timestamp()).await.unwrap());
    }

    #[tokio::test]
    async fn job_stops_when_lease_is_taken_over() {
        let s = DispatchSettings {
            heartbeat_interval: Duration::from_millis(20),
            ..settings()
        };
        let f = fixture(Behavior::WaitForCancel, 1, s).await;
        let session = f.store.create(None).await.unwrap();

        f.dispatcher.start(&session.id).await.unwrap();
        f.store
            .db()
            .claim_lease(&session.id, "other-worker", unix_timestamp())
            .await
            .unwrap();

        let done = wait_terminal(&f.store, &session.id).await;
        assert_eq!(done.status, SessionStatus::Failed);
        assert!(done.error_message.unwrap().contains("lease"));
    }
}
