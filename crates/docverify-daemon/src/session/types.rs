//! Session domain types.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::storage::{DatabaseError, SessionRow};

/// Lifecycle status of a session.
///
/// Transitions only move forward along
/// `Created -> Uploading -> Processing -> {Completed | Failed}`; steps may be
/// skipped, and nothing leaves a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Uploading => 1,
            Self::Processing => 2,
            Self::Completed | Self::Failed => 3,
        }
    }

    /// Whether a record in `self` may be rewritten with status `next`.
    ///
    /// Staying in a non-terminal status is allowed (counter updates).
    pub const fn can_transition_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "uploading" => Ok(Self::Uploading),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One applicant's processing request and its mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    /// Opaque job queue handle; present only while `Processing`.
    pub job_handle: Option<String>,
    pub total_files: u64,
    pub processed_documents: u64,
    pub total_documents: u64,
    pub progress_percentage: f64,
    pub result_available: bool,
    pub error_message: Option<String>,
    pub batch_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Modification marker; incremented by every persisted write.
    pub revision: i64,
}

impl Session {
    pub(crate) fn new(id: String, batch_id: Option<String>, now: i64) -> Self {
        Self {
            id,
            status: SessionStatus::Created,
            job_handle: None,
            total_files: 0,
            processed_documents: 0,
            total_documents: 0,
            progress_percentage: 0.0,
            result_available: false,
            error_message: None,
            batch_id,
            created_at: now,
            updated_at: now,
            revision: 1,
        }
    }

    /// Directory holding everything that belongs to this session.
    pub fn dir(&self, sessions_root: &Path) -> PathBuf {
        session_dir(sessions_root, &self.id)
    }

    /// Directory the pipeline scans for documents.
    pub fn upload_dir(&self, sessions_root: &Path) -> PathBuf {
        upload_dir(sessions_root, &self.id)
    }
}

/// `<root>/<id>`
pub fn session_dir(sessions_root: &Path, session_id: &str) -> PathBuf {
    sessions_root.join(session_id)
}

/// `<root>/<id>/uploads`
pub fn upload_dir(sessions_root: &Path, session_id: &str) -> PathBuf {
    session_dir(sessions_root, session_id).join("uploads")
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
impl From<&Session> for SessionRow {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            status: s.status.as_str().to_string(),
            job_handle: s.job_handle.clone(),
            total_files: s.total_files as i64,
            processed_documents: s.processed_documents as i64,
            total_documents: s.total_documents as i64,
            progress_percentage: s.progress_percentage,
            result_available: s.result_available,
            error_message: s.error_message.clone(),
            batch_id: s.batch_id.clone(),
            created_at: s.created_at,
            updated_at: s.updated_at,
            revision: s.revision,
        }
    }
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    #[allow(clippy::cast_sign_loss)]
    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|reason| StoreError::CorruptRecord {
                session_id: row.id.clone(),
                reason,
            })?;
        Ok(Self {
            id: row.id,
            status,
            job_handle: row.job_handle,
            total_files: row.total_files.max(0) as u64,
            processed_documents: row.processed_documents.max(0) as u64,
            total_documents: row.total_documents.max(0) as u64,
            progress_percentage: row.progress_percentage,
            result_available: row.result_available,
            error_message: row.error_message,
            batch_id: row.batch_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            revision: row.revision,
        })
    }
}

/// Session store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session not found: {session_id}")]
    NotFound { session_id: String },

    #[error("Session {session_id} is {status} and can no longer change")]
    Terminal {
        session_id: String,
        status: SessionStatus,
    },

    #[error("Invalid status transition for {session_id}: {from} -> {to}")]
    InvalidTransition {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Session {session_id} was modified concurrently")]
    Conflict { session_id: String },

    #[error("Corrupt session record {session_id}: {reason}")]
    CorruptRecord { session_id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    use SessionStatus::{Completed, Created, Failed, Processing, Uploading};

    #[test]
    fn forward_transitions_allowed() {
        assert!(Created.can_transition_to(Uploading));
        assert!(Created.can_transition_to(Processing));
        assert!(Uploading.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Uploading.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Processing));
    }

    #[test]
    fn backward_and_terminal_transitions_rejected() {
        assert!(!Processing.can_transition_to(Uploading));
        assert!(!Uploading.can_transition_to(Created));
        for terminal in [Completed, Failed] {
            for next in [Created, Uploading, Processing, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [Created, Uploading, Processing, Completed, Failed] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("done".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn corrupt_status_is_reported() {
        let mut row = SessionRow::from(&Session::new("s".into(), None, 1));
        row.status = "paused".into();
        assert!(matches!(
            Session::try_from(row),
            Err(StoreError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn upload_dir_layout() {
        let s = Session::new("abc".into(), None, 1);
        assert_eq!(
            s.upload_dir(Path::new("/data")),
            PathBuf::from("/data/abc/uploads")
        );
    }
}
