//! Master verification pipeline.
//!
//! Six ordered stages share one [`PipelineContext`]:
//! scan, classify, dispatch to agents, normalize, cross-validate, finalize.
//! Only the dispatch stage tolerates partial failure; any other stage error
//! aborts the run.

pub mod agents;
pub mod classify;
pub mod context;
pub mod document;
pub mod error;
pub mod events;
pub mod fanout;
pub mod normalize;
pub mod result;
pub mod runner;
pub mod scan;

use std::fmt;

pub use agents::{Agent, AgentInput, AgentKind, AgentRegistry, CommandAgent, RawAgentOutput};
pub use classify::{Classification, DocumentClassifier, DocumentSorter, FilenameClassifier};
pub use context::PipelineContext;
pub use document::{Document, DocumentBatch, DocumentCategory};
pub use error::{AgentError, PipelineError};
pub use events::ProgressEmitter;
pub use fanout::{AgentResults, DispatchMode};
pub use normalize::CompletenessPolicy;
pub use result::{AnalysisResult, ProcessingMetadata};
pub use runner::{MasterPipeline, PipelineJob, PipelineRunner, PipelineSettings};

/// Number of stages every run reports progress against.
pub const TOTAL_STAGES: u32 = 6;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Scan,
    Classify,
    Dispatch,
    Normalize,
    CrossValidate,
    Finalize,
}

impl Stage {
    pub const ALL: [Self; TOTAL_STAGES as usize] = [
        Self::Scan,
        Self::Classify,
        Self::Dispatch,
        Self::Normalize,
        Self::CrossValidate,
        Self::Finalize,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Scan => "DocumentScanner",
            Self::Classify => "DocumentClassifier",
            Self::Dispatch => "AgentDispatcher",
            Self::Normalize => "ResultNormalizer",
            Self::CrossValidate => "CrossValidator",
            Self::Finalize => "OutputGenerator",
        }
    }

    pub const fn index(self) -> u32 {
        match self {
            Self::Scan => 0,
            Self::Classify => 1,
            Self::Dispatch => 2,
            Self::Normalize => 3,
            Self::CrossValidate => 4,
            Self::Finalize => 5,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_indices_follow_order() {
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.index() as usize, i);
        }
    }
}
