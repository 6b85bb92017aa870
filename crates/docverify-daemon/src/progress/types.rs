//! Progress messages exchanged between pipelines, the broker, and subscribers.

use serde::{Deserialize, Serialize};

/// Prefix of every per-session channel name.
pub const CHANNEL_PREFIX: &str = "session_progress";

/// Channel carrying one session's progress.
pub fn channel_name(session_id: &str) -> String {
    format!("{CHANNEL_PREFIX}:{session_id}")
}

/// A single progress report from a running pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub stage_name: String,
    pub stage_index: u32,
    pub total_stages: u32,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_document: Option<String>,
    #[serde(default)]
    pub processed_documents: u64,
    #[serde(default)]
    pub total_documents: u64,
}

impl ProgressUpdate {
    /// `(stage_index + 1) / total_stages`, as 0-100.
    pub fn percentage(&self) -> f64 {
        if self.total_stages == 0 {
            return 0.0;
        }
        let done = f64::from(self.stage_index.saturating_add(1).min(self.total_stages));
        done / f64::from(self.total_stages) * 100.0
    }
}

/// What travels on a session channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelMessage {
    Progress(ProgressUpdate),
    /// The owning job has written the terminal status; no more progress follows.
    Done,
}

impl ChannelMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// Event delivered to stream consumers.
///
/// `completed` and `error` are never both set, and a normal update has
/// neither. Streams end after the first event with either flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage_name: String,
    pub stage_index: u32,
    pub total_stages: u32,
    pub message: String,
    pub percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_document: Option<String>,
    pub processed_documents: u64,
    pub total_documents: u64,
    pub completed: bool,
    pub error: bool,
}

impl ProgressEvent {
    pub fn from_update(update: &ProgressUpdate) -> Self {
        let message = if update.message.is_empty() {
            format!("Processing {}...", update.stage_name)
        } else {
            update.message.clone()
        };
        Self {
            stage_name: update.stage_name.clone(),
            stage_index: update.stage_index,
            total_stages: update.total_stages,
            message,
            percentage: update.percentage(),
            sub_agent: update.sub_agent.clone(),
            current_document: update.current_document.clone(),
            processed_documents: update.processed_documents,
            total_documents: update.total_documents,
            completed: false,
            error: false,
        }
    }

    pub fn completed(total_stages: u32) -> Self {
        Self {
            stage_name: "Complete".to_string(),
            stage_index: total_stages,
            total_stages,
            message: "Processing complete".to_string(),
            percentage: 100.0,
            sub_agent: None,
            current_document: None,
            processed_documents: 0,
            total_documents: 0,
            completed: true,
            error: false,
        }
    }

    pub fn failed(total_stages: u32, message: impl Into<String>) -> Self {
        Self {
            stage_name: "Error".to_string(),
            stage_index: 0,
            total_stages,
            message: message.into(),
            percentage: 0.0,
            sub_agent: None,
            current_document: None,
            processed_documents: 0,
            total_documents: 0,
            completed: false,
            error: true,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        self.completed || self.error
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn update(stage_index: u32) -> ProgressUpdate {
        ProgressUpdate {
            stage_name: "Dispatch".into(),
            stage_index,
            total_stages: 6,
            message: String::new(),
            sub_agent: None,
            current_document: None,
            processed_documents: 0,
            total_documents: 3,
        }
    }

    #[test]
    fn percentage_counts_current_stage() {
        assert!((update(0).percentage() - 100.0 / 6.0).abs() < 1e-9);
        assert!((update(5).percentage() - 100.0).abs() < 1e-9);
        let mut degenerate = update(0);
        degenerate.total_stages = 0;
        assert!(degenerate.percentage().abs() < f64::EPSILON);
    }

    #[test]
    fn channel_messages_are_tagged() {
        let done = ChannelMessage::Done.encode().unwrap();
        assert_eq!(done, r#"{"kind":"done"}"#);

        let progress = ChannelMessage::Progress(update(2)).encode().unwrap();
        assert!(progress.contains(r#""kind":"progress""#));
        assert_eq!(
            ChannelMessage::decode(&progress).unwrap(),
            ChannelMessage::Progress(update(2))
        );
        assert!(ChannelMessage::decode("not json").is_err());
    }

    #[test]
    fn event_flags() {
        let event = ProgressEvent::from_update(&update(1));
        assert!(!event.is_terminal());
        assert_eq!(event.message, "Processing Dispatch...");

        let done = ProgressEvent::completed(6);
        assert!(done.completed && !done.error);
        let failed = ProgressEvent::failed(6, "boom");
        assert!(failed.error && !failed.completed);
        assert_eq!(failed.message, "boom");
    }

    #[test]
    fn channel_name_is_deterministic() {
        assert_eq!(channel_name("abc"), "session_progress:abc");
    }
}
