//! The stored output of a completed pipeline run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::validation::CrossValidation;

use super::agents::AgentKind;
use super::normalize::{AcademicSummary, CompletenessDecision, FinancialSummary, IdentitySummary};

/// Bookkeeping about one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub total_documents_scanned: usize,
    pub documents_by_category: BTreeMap<String, usize>,
    pub processing_errors: Vec<String>,
    pub processing_warnings: Vec<String>,
    pub processing_time_seconds: f64,
}

/// Final verification record for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Identity first and last name, when extracted.
    pub applicant_name: Option<String>,
    pub identity: Option<IdentitySummary>,
    pub financial: Option<FinancialSummary>,
    pub academic: Option<AcademicSummary>,
    pub cross_validation: Option<CrossValidation>,
    pub completeness: Vec<CompletenessDecision>,
    /// Agents that were dispatched and produced no output.
    pub agent_errors: BTreeMap<AgentKind, String>,
    pub metadata: ProcessingMetadata,
}

impl AnalysisResult {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
