//! State shared by the stages of one pipeline run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use crate::progress::ProgressUpdate;
use crate::validation::CrossValidation;

use super::document::{Document, DocumentBatch};
use super::fanout::AgentResults;
use super::normalize::{AcademicSummary, CompletenessDecision, FinancialSummary, IdentitySummary};
use super::result::AnalysisResult;
use super::{Stage, TOTAL_STAGES};

/// Mutable state threaded through the stages.
#[derive(Debug)]
pub struct PipelineContext {
    pub session_id: String,
    pub input_dir: PathBuf,
    pub documents: Vec<Document>,
    pub batch: DocumentBatch,
    /// Text supplied by a classifier, keyed by document path.
    pub extracted_text: HashMap<PathBuf, String>,
    pub agent_results: AgentResults,
    pub identity: Option<IdentitySummary>,
    pub financial: Option<FinancialSummary>,
    pub academic: Option<AcademicSummary>,
    pub cross_validation: Option<CrossValidation>,
    pub completeness: Vec<CompletenessDecision>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Documents whose agent has finished.
    pub processed_documents: u64,
    pub result: Option<AnalysisResult>,
    pub started: Instant,
}

impl PipelineContext {
    pub fn new(session_id: impl Into<String>, input_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            input_dir: input_dir.into(),
            documents: Vec::new(),
            batch: DocumentBatch::default(),
            extracted_text: HashMap::new(),
            agent_results: AgentResults::new(),
            identity: None,
            financial: None,
            academic: None,
            cross_validation: None,
            completeness: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            processed_documents: 0,
            result: None,
            started: Instant::now(),
        }
    }

    pub fn total_documents(&self) -> u64 {
        self.documents.len() as u64
    }

    /// Progress update for `stage` reflecting the current counters.
    pub fn stage_update(&self, stage: Stage, message: impl Into<String>) -> ProgressUpdate {
        ProgressUpdate {
            stage_name: stage.name().to_string(),
            stage_index: stage.index(),
            total_stages: TOTAL_STAGES,
            message: message.into(),
            sub_agent: None,
            current_document: None,
            processed_documents: self.processed_documents,
            total_documents: self.total_documents(),
        }
    }
}
