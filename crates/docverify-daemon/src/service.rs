//! Verification service: the entry point that wires the session store,
//! progress hub, dispatcher and pipeline together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use docverify_core::config::Config;
use docverify_core::db::unix_timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::orchestration::{
    CancelOutcome, DispatchError, DispatchSettings, JobHandle, JobQueue, PipelinePool, TaskDispatcher,
};
use crate::pipeline::{AnalysisResult, PipelineRunner};
use crate::progress::{HubConfig, HubError, ProgressBroker, ProgressHub, Subscription, channel_name};
use crate::session::{Session, SessionStatus, SessionStore, StoreError, session_dir, upload_dir};
use crate::storage::{Database, DatabaseError};

/// Service errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Stored result for {session_id} is unreadable: {reason}")]
    CorruptResult { session_id: String, reason: String },
}

impl From<DatabaseError> for ServiceError {
    fn from(e: DatabaseError) -> Self {
        Self::Store(StoreError::Database(e))
    }
}

/// Aggregate status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Created,
    Processing,
    Completed,
    Failed,
    PartialFailure,
}

/// Sessions per status. `created` includes uploading sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub created: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub state: BatchState,
    pub total: usize,
    pub counts: StatusCounts,
    pub sessions: Vec<Session>,
}

impl BatchStatus {
    fn aggregate(batch_id: String, sessions: Vec<Session>) -> Self {
        let mut counts = StatusCounts::default();
        for session in &sessions {
            match session.status {
                SessionStatus::Created | SessionStatus::Uploading => counts.created += 1,
                SessionStatus::Processing => counts.processing += 1,
                SessionStatus::Completed => counts.completed += 1,
                SessionStatus::Failed => counts.failed += 1,
            }
        }

        let total = sessions.len();
        let state = if counts.completed == total {
            BatchState::Completed
        } else if counts.failed == total {
            BatchState::Failed
        } else if counts.processing > 0 {
            BatchState::Processing
        } else if counts.completed > 0 && counts.failed > 0 {
            BatchState::PartialFailure
        } else {
            BatchState::Created
        };

        Self {
            batch_id,
            state,
            total,
            counts,
            sessions,
        }
    }
}

/// Owns every component and exposes the session-level operations.
pub struct VerificationService {
    store: Arc<SessionStore>,
    hub: ProgressHub,
    broker: Arc<dyn ProgressBroker>,
    dispatcher: TaskDispatcher,
    sessions_root: PathBuf,
}

impl VerificationService {
    pub fn new(
        db: Database,
        broker: Arc<dyn ProgressBroker>,
        queue: Arc<dyn JobQueue>,
        runner: Arc<dyn PipelineRunner>,
        config: &Config,
        sessions_root: PathBuf,
    ) -> Self {
        let store = Arc::new(SessionStore::new(db));
        let hub = ProgressHub::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            HubConfig {
                poll_interval: Duration::from_millis(config.progress.poll_interval_ms.max(1)),
                subscriber_capacity: config.progress.subscriber_capacity,
                total_stages: crate::pipeline::TOTAL_STAGES,
            },
        );
        let pool = Arc::new(PipelinePool::new(config.daemon.max_concurrent_pipelines));
        let dispatcher = TaskDispatcher::new(
            Arc::clone(&store),
            hub.clone(),
            Arc::clone(&broker),
            queue,
            pool,
            runner,
            DispatchSettings::new(&config.dispatch, &config.pipeline, sessions_root.clone()),
        );

        Self {
            store,
            hub,
            broker,
            dispatcher,
            sessions_root,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub const fn hub(&self) -> &ProgressHub {
        &self.hub
    }

    pub const fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn sessions_root(&self) -> &Path {
        &self.sessions_root
    }

    /// Directory the pipeline scans for this session's documents.
    pub fn upload_dir(&self, session_id: &str) -> PathBuf {
        upload_dir(&self.sessions_root, session_id)
    }

    /// Create a session and its upload directory.
    pub async fn create_session(&self, batch_id: Option<&str>) -> Result<Session, ServiceError> {
        let session = self.store.create(batch_id).await?;
        tokio::fs::create_dir_all(self.upload_dir(&session.id)).await?;
        Ok(session)
    }

    /// Mark the session as receiving files.
    pub async fn begin_upload(&self, session_id: &str, total_files: u64) -> Result<Session, ServiceError> {
        let updated = self
            .store
            .modify(session_id, |s| match s.status {
                SessionStatus::Created | SessionStatus::Uploading => {
                    s.status = SessionStatus::Uploading;
                    s.total_files = total_files;
                    true
                }
                _ => false,
            })
            .await?;

        if let Some(session) = updated {
            return Ok(session);
        }
        let current = self.store.get(session_id).await?;
        Err(StoreError::InvalidTransition {
            session_id: session_id.to_string(),
            from: current.status,
            to: SessionStatus::Uploading,
        }
        .into())
    }

    pub async fn start(&self, session_id: &str) -> Result<JobHandle, ServiceError> {
        Ok(self.dispatcher.start(session_id).await?)
    }

    pub async fn cancel(&self, session_id: &str) -> Result<CancelOutcome, ServiceError> {
        Ok(self.dispatcher.cancel(session_id).await?)
    }

    pub async fn get(&self, session_id: &str) -> Result<Session, ServiceError> {
        Ok(self.store.get(session_id).await?)
    }

    pub async fn subscribe(&self, session_id: &str) -> Result<Subscription, ServiceError> {
        Ok(self.hub.subscribe(session_id).await?)
    }

    /// Stored analysis result; `None` until the session completes.
    pub async fn result(&self, session_id: &str) -> Result<Option<AnalysisResult>, ServiceError> {
        let row = match self.store.db().get_result(session_id).await {
            Ok(row) => row,
            Err(DatabaseError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        AnalysisResult::from_json(&row.result_json)
            .map(Some)
            .map_err(|e| ServiceError::CorruptResult {
                session_id: session_id.to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus, ServiceError> {
        let sessions = self.store.list_batch(batch_id).await?;
        if sessions.is_empty() {
            return Err(ServiceError::BatchNotFound(batch_id.to_string()));
        }
        Ok(BatchStatus::aggregate(batch_id.to_string(), sessions))
    }

    /// Revoke any job, then remove the record, result, channel buffer and files.
    ///
    /// Returns `false` when the session did not exist.
    pub async fn delete(&self, session_id: &str) -> Result<bool, ServiceError> {
        let existed = self.store.delete(session_id, self.dispatcher.queue()).await?;

        if let Err(e) = self.broker.purge(&channel_name(session_id)).await {
            warn!(session_id, error = %e, "Failed to purge progress channel");
        }
        self.hub.close(session_id);

        match tokio::fs::remove_dir_all(session_dir(&self.sessions_root, session_id)).await {
            Ok(()) => debug!(session_id, "Session directory removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(existed)
    }

    /// Delete every session created more than `max_age` ago.
    pub async fn cleanup_expired(&self, max_age: Duration) -> Result<usize, ServiceError> {
        let age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let cutoff = unix_timestamp().saturating_sub(age);
        let mut removed = 0;
        for id in self.store.created_before(cutoff).await? {
            if self.delete(&id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(count = removed, "Expired sessions removed");
        }
        let stats = self.hub.stats();
        debug!(
            sessions = stats.session_count,
            subscribers = stats.total_subscribers,
            relays = stats.running_relays,
            "Progress hub after cleanup"
        );
        Ok(removed)
    }

    /// Fail sessions left `Processing` by a worker that no longer runs.
    ///
    /// A session counts as abandoned when its job lease is missing or has not
    /// been renewed within `lease_ttl`. Jobs owned by other live processes
    /// sharing the database keep renewing and are left alone.
    pub async fn recover_interrupted(&self) -> Result<usize, ServiceError> {
        let ttl = i64::try_from(self.dispatcher.settings().lease_ttl.as_secs()).unwrap_or(i64::MAX);
        let cutoff = unix_timestamp().saturating_sub(ttl);
        let candidates = self
            .store
            .db()
            .list_orphaned_sessions(cutoff)
            .await?;
        let mut recovered = 0;
        for id in candidates {
            let written = self
                .store
                .modify(&id, |s| {
                    let orphaned = s.status == SessionStatus::Processing
                        && s.job_handle.as_ref().is_none_or(|h| {
                            !self.dispatcher.queue().is_active(&JobHandle::from(h.clone()))
                        });
                    if orphaned {
                        s.status = SessionStatus::Failed;
                        s.error_message = Some("Job lost: worker stopped before finishing".into());
                        s.job_handle = None;
                    }
                    orphaned
                })
                .await?;
            if written.is_some() {
                warn!(session_id = %id, "Interrupted session marked failed");
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::BoxFuture;
    use crate::orchestration::LocalJobQueue;
    use crate::pipeline::{PipelineError, PipelineJob};
    use crate::progress::LocalBroker;

    struct NeverRuns;

    impl PipelineRunner for NeverRuns {
        fn run(&self, job: PipelineJob) -> BoxFuture<'static, Result<AnalysisResult, PipelineError>> {
            Box::pin(async move {
                job.cancel.cancelled().await;
                Err(PipelineError::Cancelled)
            })
        }
    }

    async fn service(root: &Path) -> VerificationService {
        VerificationService::new(
            Database::open_in_memory().await.unwrap(),
            Arc::new(LocalBroker::new()),
            Arc::new(LocalJobQueue::new()),
            Arc::new(NeverRuns),
            &Config::default(),
            root.to_path_buf(),
        )
    }

    fn session_with(status: SessionStatus) -> Session {
        let mut s = Session::new(uuid::Uuid::new_v4().to_string(), Some("b".into()), 0);
        s.status = status;
        s
    }

    #[test]
    fn batch_state_aggregation() {
        use SessionStatus::{Completed, Created, Failed, Processing, Uploading};
        let state = |statuses: &[SessionStatus]| {
            BatchStatus::aggregate("b".into(), statuses.iter().copied().map(session_with).collect()).state
        };
        assert_eq!(state(&[Completed, Completed]), BatchState::Completed);
        assert_eq!(state(&[Failed, Failed]), BatchState::Failed);
        assert_eq!(state(&[Completed, Processing, Failed]), BatchState::Processing);
        assert_eq!(state(&[Completed, Failed]), BatchState::PartialFailure);
        assert_eq!(state(&[Created, Uploading]), BatchState::Created);
        assert_eq!(state(&[Completed, Created]), BatchState::Created);
    }

    #[tokio::test]
    async fn upload_moves_created_to_uploading() {
        let root = tempfile::tempdir().unwrap();
        let svc = service(root.path()).await;
        let session = svc.create_session(None).await.unwrap();
        assert!(svc.upload_dir(&session.id).is_dir());

        let uploading = svc.begin_upload(&session.id, 3).await.unwrap();
        assert_eq!(uploading.status, SessionStatus::Uploading);
        assert_eq!(uploading.total_files, 3);
    }

    #[tokio::test]
    async fn delete_removes_record_and_files() {
        let root = tempfile::tempdir().unwrap();
        let svc = service(root.path()).await;
        let session = svc.create_session(Some("batch-1")).await.unwrap();
        svc.start(&session.id).await.unwrap();

        assert!(svc.delete(&session.id).await.unwrap());
        assert!(!session_dir(root.path(), &session.id).exists());
        assert!(matches!(
            svc.get(&session.id).await,
            Err(ServiceError::Store(StoreError::NotFound { .. }))
        ));
        assert!(!svc.delete(&session.id).await.unwrap());
    }

    #[tokio::test]
    async fn missing_result_is_none() {
        let root = tempfile::tempdir().unwrap();
        let svc = service(root.path()).await;
        let session = svc.create_session(None).await.unwrap();
        assert!(svc.result(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_sessions() {
        let root = tempfile::tempdir().unwrap();
        let svc = service(root.path()).await;
        let session = svc.create_session(None).await.unwrap();

        assert_eq!(svc.cleanup_expired(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(svc.cleanup_expired(Duration::ZERO).await.unwrap(), 1);
        assert!(svc.get(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn unknown_batch_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let svc = service(root.path()).await;
        assert!(matches!(
            svc.batch_status("nope").await,
            Err(ServiceError::BatchNotFound(_))
        ));
    }
}
