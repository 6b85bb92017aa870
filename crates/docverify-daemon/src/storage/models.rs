//! Database models for the `DocVerify` daemon.

use serde::{Deserialize, Serialize};

/// Session record as stored.
///
/// `status` holds the lowercase status name; see `session::SessionStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub status: String,
    pub job_handle: Option<String>,
    pub total_files: i64,
    pub processed_documents: i64,
    pub total_documents: i64,
    pub progress_percentage: f64,
    pub result_available: bool,
    pub error_message: Option<String>,
    pub batch_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub revision: i64,
}

/// Stored final analysis for a session.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnalysisResultRow {
    pub session_id: String,
    pub result_json: String,
    pub created_at: i64,
}

/// Buffered publish/subscribe message.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProgressMessageRow {
    pub id: i64,
    pub channel: String,
    pub payload: String,
    pub created_at: i64,
}
