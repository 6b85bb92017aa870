//! Session store: durable session records behind a read-through cache.
//!
//! The cache is never trusted on its own. Every `get` compares the cached
//! revision with the stored one and reloads when a writer (possibly in another
//! process) has moved the record on. Writes are compare-and-swap on the
//! revision, so concurrent writers cannot silently overwrite each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use docverify_core::db::unix_timestamp;
use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::orchestration::{JobHandle, JobQueue};
use crate::progress::ProgressUpdate;
use crate::storage::{Database, DatabaseError, SessionRow};

use super::types::{Session, StoreError};

/// How many times a read-modify-write is retried after losing a revision race.
const MAX_CONFLICT_RETRIES: usize = 3;

/// Registry of session records, their cache, and per-session locks.
pub struct SessionStore {
    db: Database,
    cache: RwLock<HashMap<String, Session>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Underlying database handle.
    pub const fn db(&self) -> &Database {
        &self.db
    }

    /// Create a session in `Created`.
    pub async fn create(&self, batch_id: Option<&str>) -> Result<Session, StoreError> {
        let session = Session::new(
            uuid::Uuid::new_v4().to_string(),
            batch_id.map(str::to_string),
            unix_timestamp(),
        );
        self.db.insert_session(&SessionRow::from(&session)).await?;
        self.cache
            .write()
            .await
            .insert(session.id.clone(), session.clone());

        info!(session_id = %session.id, batch_id = ?session.batch_id, "Session created");
        Ok(session)
    }

    /// Read a session, reloading from storage when the stored revision is newer.
    pub async fn get(&self, id: &str) -> Result<Session, StoreError> {
        let Some(stored_revision) = self.db.session_revision(id).await? else {
            self.cache.write().await.remove(id);
            return Err(StoreError::NotFound {
                session_id: id.to_string(),
            });
        };

        if let Some(cached) = self.cache.read().await.get(id)
            && cached.revision >= stored_revision
        {
            return Ok(cached.clone());
        }

        let row = self.db.get_session(id).await.map_err(|e| match e {
            DatabaseError::NotFound(_) => StoreError::NotFound {
                session_id: id.to_string(),
            },
            other => StoreError::Database(other),
        })?;
        let session = Session::try_from(row)?;
        debug!(session_id = id, revision = session.revision, "Session reloaded from storage");
        self.remember(&session).await;
        Ok(session)
    }

    /// Persist `session` atomically.
    ///
    /// `session.revision` must be the revision it was read at. The status
    /// change is validated against the stored record; a stale revision yields
    /// [`StoreError::Conflict`]. Returns the record as written.
    pub async fn update(&self, session: &Session) -> Result<Session, StoreError> {
        let current = self.get(&session.id).await?;
        if current.status.is_terminal() {
            return Err(StoreError::Terminal {
                session_id: session.id.clone(),
                status: current.status,
            });
        }
        if !current.status.can_transition_to(session.status) {
            return Err(StoreError::InvalidTransition {
                session_id: session.id.clone(),
                from: current.status,
                to: session.status,
            });
        }
        if current.revision != session.revision {
            return Err(StoreError::Conflict {
                session_id: session.id.clone(),
            });
        }

        let Some((revision, updated_at)) = self
            .db
            .compare_and_swap_session(&SessionRow::from(session))
            .await?
        else {
            return Err(StoreError::Conflict {
                session_id: session.id.clone(),
            });
        };

        let mut written = session.clone();
        written.revision = revision;
        written.updated_at = updated_at;
        self.remember(&written).await;

        if current.status != written.status {
            info!(
                session_id = %written.id,
                from = %current.status,
                to = %written.status,
                "Session status changed"
            );
        }
        Ok(written)
    }

    /// Acquire the per-session lock.
    ///
    /// Hold it only across quick read-modify-write sequences, never across a
    /// pipeline run or any other long wait.
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Read-modify-write under the per-session lock.
    ///
    /// `f` returns `false` to leave the record untouched, in which case `Ok(None)`
    /// is returned. Revision races with other processes are retried.
    pub async fn modify<F>(&self, id: &str, f: F) -> Result<Option<Session>, StoreError>
    where
        F: FnMut(&mut Session) -> bool,
    {
        let _guard = self.lock(id).await;
        self.modify_locked(id, f).await
    }

    /// [`modify`](Self::modify) for callers already holding [`lock`](Self::lock).
    pub async fn modify_locked<F>(&self, id: &str, mut f: F) -> Result<Option<Session>, StoreError>
    where
        F: FnMut(&mut Session) -> bool,
    {
        let mut attempt = 0;
        loop {
            let mut session = self.get(id).await?;
            if !f(&mut session) {
                return Ok(None);
            }
            match self.update(&session).await {
                Err(StoreError::Conflict { .. }) if attempt + 1 < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(session_id = id, attempt, "Revision conflict, retrying");
                }
                other => return other.map(Some),
            }
        }
    }

    /// Fold a relayed progress update into the session counters.
    ///
    /// Terminal sessions are left untouched.
    pub async fn apply_progress(
        &self,
        id: &str,
        update: &ProgressUpdate,
    ) -> Result<Option<Session>, StoreError> {
        let percentage = update.percentage();
        self.modify(id, |s| {
            if s.status.is_terminal() {
                return false;
            }
            s.processed_documents = update.processed_documents;
            s.total_documents = update.total_documents;
            s.progress_percentage = percentage;
            true
        })
        .await
    }

    /// Revoke any active job, then remove the record and its stored result.
    ///
    /// Returns `false` when the session did not exist.
    pub async fn delete(&self, id: &str, jobs: &dyn JobQueue) -> Result<bool, StoreError> {
        let guard = self.lock(id).await;
        match self.get(id).await {
            Ok(session) => {
                if let Some(handle) = session.job_handle {
                    let revoked = jobs.revoke(&JobHandle::from(handle));
                    debug!(session_id = id, revoked, "Revoked job before delete");
                }
            }
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => warn!(session_id = id, error = %e, "Deleting unreadable session"),
        }

        let existed = self.db.delete_session(id).await?;
        self.cache.write().await.remove(id);
        drop(guard);
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        if existed {
            info!(session_id = id, "Session deleted");
        }
        Ok(existed)
    }

    /// Sessions in a batch, oldest first.
    pub async fn list_batch(&self, batch_id: &str) -> Result<Vec<Session>, StoreError> {
        let rows = self.db.list_sessions_by_batch(batch_id).await?;
        let sessions = rows
            .into_iter()
            .map(Session::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        for session in &sessions {
            self.remember(session).await;
        }
        Ok(sessions)
    }

    /// IDs of sessions created before `cutoff` (Unix seconds).
    pub async fn created_before(&self, cutoff: i64) -> Result<Vec<String>, StoreError> {
        Ok(self.db.list_sessions_created_before(cutoff).await?)
    }

    async fn remember(&self, session: &Session) {
        let mut cache = self.cache.write().await;
        match cache.get(&session.id) {
            Some(existing) if existing.revision > session.revision => {}
            _ => {
                cache.insert(session.id.clone(), session.clone());
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::orchestration::LocalJobQueue;
    use crate::session::SessionStatus;

    async fn store() -> SessionStore {
        SessionStore::new(Database::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = store().await;
        let created = store.create(Some("b1")).await.unwrap();
        let fetched = store.get(&created.id).await.unwrap();
        assert_eq!(created, fetched);
        assert_eq!(fetched.status, SessionStatus::Created);
        assert_eq!(fetched.batch_id.as_deref(), Some("b1"));
    }

    #[tokio::test]
    async fn update_bumps_revision() {
        let store = store().await;
        let mut session = store.create(None).await.unwrap();
        session.status = SessionStatus::Uploading;
        session.total_files = 3;

        let written = store.update(&session).await.unwrap();
        assert_eq!(written.revision, session.revision + 1);
        assert_eq!(store.get(&session.id).await.unwrap().total_files, 3);
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = store().await;
        let session = store.create(None).await.unwrap();

        let mut first = session.clone();
        first.status = SessionStatus::Uploading;
        store.update(&first).await.unwrap();

        let mut second = session;
        second.total_files = 9;
        assert!(matches!(
            store.update(&second).await,
            Err(StoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn terminal_session_is_immutable() {
        let store = store().await;
        let session = store.create(None).await.unwrap();
        store
            .modify(&session.id, |s| {
                s.status = SessionStatus::Failed;
                s.error_message = Some("boom".into());
                true
            })
            .await
            .unwrap();

        let err = store
            .modify(&session.id, |s| {
                s.status = SessionStatus::Completed;
                true
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Terminal { .. }));
        assert_eq!(
            store.get(&session.id).await.unwrap().status,
            SessionStatus::Failed
        );
    }

    #[tokio::test]
    async fn backward_transition_rejected() {
        let store = store().await;
        let session = store.create(None).await.unwrap();
        store
            .modify(&session.id, |s| {
                s.status = SessionStatus::Processing;
                true
            })
            .await
            .unwrap();
        let err = store
            .modify(&session.id, |s| {
                s.status = SessionStatus::Uploading;
                true
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn apply_progress_skips_terminal() {
        let store = store().await;
        let session = store.create(None).await.unwrap();
        let update = ProgressUpdate {
            stage_name: "Dispatch".into(),
            stage_index: 2,
            total_stages: 6,
            message: String::new(),
            sub_agent: None,
            current_document: None,
            processed_documents: 1,
            total_documents: 3,
        };

        let applied = store.apply_progress(&session.id, &update).await.unwrap();
        let applied = applied.unwrap();
        assert_eq!(applied.processed_documents, 1);
        assert!((applied.progress_percentage - 50.0).abs() < 1e-9);

        store
            .modify(&session.id, |s| {
                s.status = SessionStatus::Completed;
                true
            })
            .await
            .unwrap();
        assert!(
            store
                .apply_progress(&session.id, &update)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = store().await;
        let jobs = LocalJobQueue::new();
        let session = store.create(None).await.unwrap();

        assert!(store.delete(&session.id, &jobs).await.unwrap());
        assert!(matches!(
            store.get(&session.id).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(!store.delete(&session.id, &jobs).await.unwrap());
    }
}
