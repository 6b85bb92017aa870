//! Database queries for the `DocVerify` daemon.

use docverify_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{AnalysisResultRow, ProgressMessageRow, SessionRow};

impl Database {
    // =========================================================================
    // Session queries
    // =========================================================================

    /// Insert a freshly created session record.
    pub async fn insert_session(&self, row: &SessionRow) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO sessions (
                id, status, job_handle, total_files, processed_documents, total_documents,
                progress_percentage, result_available, error_message, batch_id,
                created_at, updated_at, revision
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&row.id)
        .bind(&row.status)
        .bind(&row.job_handle)
        .bind(row.total_files)
        .bind(row.processed_documents)
        .bind(row.total_documents)
        .bind(row.progress_percentage)
        .bind(row.result_available)
        .bind(&row.error_message)
        .bind(&row.batch_id)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.revision)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Get a session by ID.
    pub async fn get_session(&self, id: &str) -> Result<SessionRow, DatabaseError> {
        sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Session {id}")))
    }

    /// Current modification marker of a session, if it exists.
    pub async fn session_revision(&self, id: &str) -> Result<Option<i64>, DatabaseError> {
        let revision: Option<(i64,)> = sqlx::query_as("SELECT revision FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(revision.map(|(r,)| r))
    }

    /// Overwrite a session record if its stored revision still equals `row.revision`.
    ///
    /// On success the stored revision is incremented and `updated_at` refreshed;
    /// the new `(revision, updated_at)` pair is returned. `None` means another
    /// writer got there first (or the row was deleted).
    pub async fn compare_and_swap_session(
        &self,
        row: &SessionRow,
    ) -> Result<Option<(i64, i64)>, DatabaseError> {
        let now = unix_timestamp();
        let next_revision = row.revision + 1;

        let result = sqlx::query(
            r"
            UPDATE sessions SET
                status = ?, job_handle = ?, total_files = ?, processed_documents = ?,
                total_documents = ?, progress_percentage = ?, result_available = ?,
                error_message = ?, batch_id = ?, updated_at = ?, revision = ?
            WHERE id = ? AND revision = ?
            ",
        )
        .bind(&row.status)
        .bind(&row.job_handle)
        .bind(row.total_files)
        .bind(row.processed_documents)
        .bind(row.total_documents)
        .bind(row.progress_percentage)
        .bind(row.result_available)
        .bind(&row.error_message)
        .bind(&row.batch_id)
        .bind(now)
        .bind(next_revision)
        .bind(&row.id)
        .bind(row.revision)
        .execute(self.pool())
        .await?;

        Ok((result.rows_affected() == 1).then_some((next_revision, now)))
    }

    /// Delete a session. Its stored result goes with it.
    pub async fn delete_session(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All sessions belonging to a batch, oldest first.
    pub async fn list_sessions_by_batch(
        &self,
        batch_id: &str,
    ) -> Result<Vec<SessionRow>, DatabaseError> {
        let sessions = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE batch_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(batch_id)
        .fetch_all(self.pool())
        .await?;
        Ok(sessions)
    }

    /// IDs of sessions created strictly before `cutoff` (Unix seconds).
    pub async fn list_sessions_created_before(
        &self,
        cutoff: i64,
    ) -> Result<Vec<String>, DatabaseError> {
        let ids: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM sessions WHERE created_at < ? ORDER BY created_at ASC")
                .bind(cutoff)
                .fetch_all(self.pool())
                .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    // =========================================================================
    // Job lease queries
    // =========================================================================

    /// Record `worker_id` as the owner of the session's job, heartbeat `now`.
    pub async fn claim_lease(&self, session_id: &str, worker_id: &str, now: i64) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO job_leases (session_id, worker_id, heartbeat_at)
            VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                worker_id = excluded.worker_id,
                heartbeat_at = excluded.heartbeat_at
            ",
        )
        .bind(session_id)
        .bind(worker_id)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Refresh the heartbeat. Returns `false` when `worker_id` no longer owns the lease.
    pub async fn renew_lease(&self, session_id: &str, worker_id: &str, now: i64) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("UPDATE job_leases SET heartbeat_at = ? WHERE session_id = ? AND worker_id = ?")
                .bind(now)
                .bind(session_id)
                .bind(worker_id)
                .execute(self.pool())
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop the lease if `worker_id` still holds it.
    pub async fn release_lease(&self, session_id: &str, worker_id: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM job_leases WHERE session_id = ? AND worker_id = ?")
            .bind(session_id)
            .bind(worker_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Processing sessions with no lease, or whose heartbeat is older than `cutoff`.
    pub async fn list_orphaned_sessions(&self, cutoff: i64) -> Result<Vec<String>, DatabaseError> {
        let ids: Vec<(String,)> = sqlx::query_as(
            r"
            SELECT s.id FROM sessions s
            LEFT JOIN job_leases l ON l.session_id = s.id
            WHERE s.status = 'processing' AND (l.heartbeat_at IS NULL OR l.heartbeat_at < ?)
            ORDER BY s.created_at ASC
            ",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    // =========================================================================
    // Analysis result queries
    // =========================================================================

    /// Store (or replace) the final analysis for a session.
    pub async fn save_result(&self, session_id: &str, result_json: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO analysis_results (session_id, result_json, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                result_json = excluded.result_json,
                created_at = excluded.created_at
            ",
        )
        .bind(session_id)
        .bind(result_json)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fetch the stored analysis for a session.
    pub async fn get_result(&self, session_id: &str) -> Result<AnalysisResultRow, DatabaseError> {
        sqlx::query_as::<_, AnalysisResultRow>(
            "SELECT * FROM analysis_results WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Result for session {session_id}")))
    }

    // =========================================================================
    // Progress message buffer queries
    // =========================================================================

    /// Append a message to a channel. Returns its sequence id.
    pub async fn append_progress_message(
        &self,
        channel: &str,
        payload: &str,
    ) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO progress_messages (channel, payload, created_at) VALUES (?, ?, ?)",
        )
        .bind(channel)
        .bind(payload)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Messages on `channel` with id greater than `after_id`, in publish order.
    pub async fn progress_messages_after(
        &self,
        channel: &str,
        after_id: i64,
    ) -> Result<Vec<ProgressMessageRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, ProgressMessageRow>(
            "SELECT * FROM progress_messages WHERE channel = ? AND id > ? ORDER BY id ASC",
        )
        .bind(channel)
        .bind(after_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Highest message id on `channel`, or 0 when empty.
    pub async fn latest_progress_message_id(&self, channel: &str) -> Result<i64, DatabaseError> {
        let (id,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(id), 0) FROM progress_messages WHERE channel = ?")
                .bind(channel)
                .fetch_one(self.pool())
                .await?;
        Ok(id)
    }

    /// Drop every buffered message on a channel.
    pub async fn delete_progress_messages(&self, channel: &str) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM progress_messages WHERE channel = ?")
            .bind(channel)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn row(id: &str) -> SessionRow {
        SessionRow {
            id: id.to_string(),
            status: "created".to_string(),
            job_handle: None,
            total_files: 0,
            processed_documents: 0,
            total_documents: 0,
            progress_percentage: 0.0,
            result_available: false,
            error_message: None,
            batch_id: Some("batch-1".to_string()),
            created_at: 100,
            updated_at: 100,
            revision: 1,
        }
    }

    #[tokio::test]
    async fn insert_and_get_session() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_session(&row("s1")).await.unwrap();

        let stored = db.get_session("s1").await.unwrap();
        assert_eq!(stored, row("s1"));
        assert_eq!(db.session_revision("s1").await.unwrap(), Some(1));
        assert!(matches!(
            db.get_session("missing").await,
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_revision() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_session(&row("s1")).await.unwrap();

        let mut update = row("s1");
        update.status = "uploading".to_string();
        let (revision, _) = db.compare_and_swap_session(&update).await.unwrap().unwrap();
        assert_eq!(revision, 2);

        // Same expected revision again: someone else already moved it on.
        update.status = "processing".to_string();
        assert!(db.compare_and_swap_session(&update).await.unwrap().is_none());
        assert_eq!(db.get_session("s1").await.unwrap().status, "uploading");
    }

    #[tokio::test]
    async fn delete_cascades_result() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_session(&row("s1")).await.unwrap();
        db.save_result("s1", "{}").await.unwrap();
        assert!(db.get_result("s1").await.is_ok());

        assert!(db.delete_session("s1").await.unwrap());
        assert!(db.get_result("s1").await.is_err());
        assert!(!db.delete_session("s1").await.unwrap());
    }

    #[tokio::test]
    async fn batch_and_age_listing() {
        let db = Database::open_in_memory().await.unwrap();
        let mut old = row("old");
        old.created_at = 10;
        db.insert_session(&old).await.unwrap();
        db.insert_session(&row("new")).await.unwrap();

        let batch = db.list_sessions_by_batch("batch-1").await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, "old");

        let expired = db.list_sessions_created_before(50).await.unwrap();
        assert_eq!(expired, vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn only_stale_or_missing_leases_are_orphaned() {
        let db = Database::open_in_memory().await.unwrap();
        for id in ["live", "stale", "unleased", "idle"] {
            let mut r = row(id);
            if id != "idle" {
                r.status = "processing".to_string();
            }
            db.insert_session(&r).await.unwrap();
        }
        db.claim_lease("live", "w1", 1_000).await.unwrap();
        db.claim_lease("stale", "w2", 100).await.unwrap();

        let orphaned = db.list_orphaned_sessions(500).await.unwrap();
        assert_eq!(orphaned.len(), 2);
        assert!(orphaned.contains(&"stale".to_string()));
        assert!(orphaned.contains(&"unleased".to_string()));

        // A foreign worker cannot renew or release someone else's lease.
        assert!(!db.renew_lease("live", "w2", 2_000).await.unwrap());
        db.release_lease("live", "w2").await.unwrap();
        assert!(db.renew_lease("live", "w1", 2_000).await.unwrap());
        assert!(db.list_orphaned_sessions(1_500).await.unwrap().contains(&"stale".to_string()));
        assert!(!db.list_orphaned_sessions(1_500).await.unwrap().contains(&"live".to_string()));
    }

    #[tokio::test]
    async fn progress_messages_are_ordered_per_channel() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(db.latest_progress_message_id("a").await.unwrap(), 0);

        let first = db.append_progress_message("a", "1").await.unwrap();
        db.append_progress_message("b", "x").await.unwrap();
        db.append_progress_message("a", "2").await.unwrap();

        let after = db.progress_messages_after("a", first).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].payload, "2");
        assert_eq!(db.progress_messages_after("a", 0).await.unwrap().len(), 2);

        assert_eq!(db.delete_progress_messages("a").await.unwrap(), 2);
        assert_eq!(db.progress_messages_after("b", 0).await.unwrap().len(), 1);
    }
}
