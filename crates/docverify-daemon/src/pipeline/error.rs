//! Pipeline and agent errors.

use std::time::Duration;

/// Errors that abort a pipeline attempt.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Document scan failed: {0}")]
    Scan(String),

    #[error("Document classification failed: {0}")]
    Classification(String),

    /// Produced by the dispatcher when an attempt overruns its deadline.
    #[error("Pipeline timed out after {}s ({attempts} attempts)", .limit.as_secs())]
    Timeout { limit: Duration, attempts: u32 },

    #[error("cancelled by user")]
    Cancelled,

    /// Carries the agent errors that explain why.
    #[error("No agent produced a usable result: {0}")]
    NoResult(String),

    #[error("{0}")]
    Unexpected(String),
}

impl PipelineError {
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Outcome of a single agent call that did not yield output.
///
/// Recorded per agent and never fatal for the batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("{0}")]
    Failed(String),

    #[error("did not finish within the {}s dispatch deadline", .0.as_secs())]
    DeadlineExceeded(Duration),

    #[error("cancelled before completion")]
    Cancelled,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_message_is_stable() {
        assert_eq!(PipelineError::Cancelled.to_string(), "cancelled by user");
    }

    #[test]
    fn timeout_message_names_limit_and_attempts() {
        let err = PipelineError::Timeout {
            limit: Duration::from_secs(600),
            attempts: 3,
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Pipeline timed out after 600s (3 attempts)");
    }

    #[test]
    fn agent_deadline_message() {
        let err = AgentError::DeadlineExceeded(Duration::from_secs(30));
        assert_eq!(err.to_string(), "did not finish within the 30s dispatch deadline");
    }
}
