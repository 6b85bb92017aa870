//! The master pipeline and the runner contract the dispatcher drives.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use docverify_core::config::{Config, PipelineConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::BoxFuture;
use crate::progress::ProgressUpdate;
use crate::validation::{CrossValidationInput, CrossValidator};

use super::Stage;
use super::agents::{AgentInput, AgentKind, AgentRegistry};
use super::classify::DocumentSorter;
use super::context::PipelineContext;
use super::error::{AgentError, PipelineError};
use super::events::ProgressEmitter;
use super::fanout::{AgentCompletion, CompletionSink, DispatchMode, WorkUnit, dispatch_agents};
use super::normalize::{AcademicSummary, CompletenessPolicy, ExtractionStatus, FinancialSummary, IdentitySummary};
use super::result::{AnalysisResult, ProcessingMetadata};
use super::scan::scan_documents;

/// Everything one pipeline attempt needs.
#[derive(Debug)]
pub struct PipelineJob {
    pub session_id: String,
    pub input_dir: PathBuf,
    pub progress: ProgressEmitter,
    /// Checked between stages and at agent-dispatch boundaries.
    pub cancel: CancellationToken,
}

/// Something that can execute a pipeline attempt.
pub trait PipelineRunner: Send + Sync {
    fn run(&self, job: PipelineJob) -> BoxFuture<'static, Result<AnalysisResult, PipelineError>>;
}

/// Tunables for [`MasterPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub parallel_dispatch: bool,
    pub agent_deadline: Duration,
    pub name_match_threshold: f64,
    pub max_file_size_bytes: u64,
    pub financial_threshold_eur: f64,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            parallel_dispatch: config.parallel_dispatch,
            agent_deadline: Duration::from_secs(config.agent_deadline_secs),
            name_match_threshold: config.name_match_threshold,
            max_file_size_bytes: config.max_file_size_bytes,
            financial_threshold_eur: config.financial_threshold_eur,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// Scan, classify, dispatch, normalize, cross-validate, finalize.
#[derive(Clone)]
pub struct MasterPipeline {
    settings: PipelineSettings,
    sorter: DocumentSorter,
    agents: AgentRegistry,
    completeness: CompletenessPolicy,
}

/// Reports each finished agent as a dispatch-stage progress update.
struct DispatchProgress<'a> {
    emitter: &'a ProgressEmitter,
    template: ProgressUpdate,
    documents: BTreeMap<AgentKind, (u64, Option<String>)>,
    processed: u64,
}

impl CompletionSink for DispatchProgress<'_> {
    fn agent_finished(&mut self, completion: AgentCompletion) -> BoxFuture<'_, ()> {
        let (count, first) = self.documents.get(&completion.kind).cloned().unwrap_or_default();
        self.processed += count;
        let verb = if completion.succeeded { "completed processing" } else { "failed" };
        let update = ProgressUpdate {
            message: format!(
                "Agent {} {verb} ({}/{})",
                completion.kind, completion.finished, completion.total
            ),
            sub_agent: Some(completion.kind.to_string()),
            current_document: first,
            processed_documents: self.processed,
            ..self.template.clone()
        };
        Box::pin(self.emitter.emit(update))
    }
}

impl MasterPipeline {
    pub fn new(settings: PipelineSettings, sorter: DocumentSorter, agents: AgentRegistry) -> Self {
        Self {
            settings,
            sorter,
            agents,
            completeness: CompletenessPolicy::default(),
        }
    }

    /// Pipeline with configured command agents, strategy and completeness rules.
    pub fn from_config(config: &Config) -> docverify_core::Result<Self> {
        let agents = AgentRegistry::from_config(&config.agents)?;
        if agents.is_empty() {
            warn!("No agents configured; every dispatch will record failures");
        }
        let completeness = CompletenessPolicy::from_config(&config.completeness)?;
        Ok(Self::new(
            PipelineSettings::from(&config.pipeline),
            DocumentSorter::new(config.pipeline.classification_strategy),
            agents,
        )
        .with_completeness(completeness))
    }

    #[must_use]
    pub fn with_completeness(mut self, policy: CompletenessPolicy) -> Self {
        self.completeness = policy;
        self
    }

    /// Run all stages against `job.input_dir`.
    pub async fn execute(&self, job: PipelineJob) -> Result<AnalysisResult, PipelineError> {
        let mut ctx = PipelineContext::new(job.session_id.clone(), job.input_dir.clone());

        for stage in Stage::ALL {
            if job.cancel.is_cancelled() {
                info!(session_id = %ctx.session_id, stage = %stage, "Pipeline cancelled before stage");
                return Err(PipelineError::Cancelled);
            }
            job.progress.emit(ctx.stage_update(stage, "")).await;
            info!(session_id = %ctx.session_id, stage = %stage, "Stage started");

            match stage {
                Stage::Scan => self.scan(&mut ctx).await?,
                Stage::Classify => self.classify(&mut ctx)?,
                Stage::Dispatch => self.dispatch(&mut ctx, &job).await,
                Stage::Normalize => self.normalize(&mut ctx),
                Stage::CrossValidate => self.cross_validate(&mut ctx),
                Stage::Finalize => Self::finalize(&mut ctx)?,
            }
        }

        ctx.result
            .take()
            .ok_or_else(|| PipelineError::Unexpected("pipeline finished without a result".into()))
    }

    async fn scan(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        let outcome = scan_documents(&ctx.input_dir, self.settings.max_file_size_bytes).await?;
        ctx.documents = outcome.documents;
        ctx.warnings.extend(outcome.warnings);
        info!(session_id = %ctx.session_id, documents = ctx.documents.len(), "Documents scanned");
        Ok(())
    }

    fn classify(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        let outcome = self.sorter.sort(&ctx.documents)?;
        ctx.batch = outcome.batch;
        ctx.extracted_text.extend(outcome.extracted_text);
        ctx.warnings.extend(outcome.warnings);
        Ok(())
    }

    /// Build one unit per category present; missing agents are recorded as failures.
    fn build_units(&self, ctx: &mut PipelineContext, cancel: &CancellationToken) -> Vec<WorkUnit> {
        let mut units = Vec::new();
        for kind in AgentKind::ALL {
            let docs = ctx.batch.documents(kind.category());
            let Some(first) = docs.first() else { continue };

            let selected: Vec<PathBuf> = if kind == AgentKind::Academic {
                docs.iter().map(|d| d.path.clone()).collect()
            } else {
                if docs.len() > 1 {
                    ctx.warnings.push(format!(
                        "Multiple {kind} documents found ({}), only processing first: {}",
                        docs.len(),
                        first.file_name
                    ));
                }
                vec![first.path.clone()]
            };

            let Some(agent) = self.agents.get(kind) else {
                warn!(session_id = %ctx.session_id, agent = %kind, "No agent configured");
                ctx.agent_results.insert(
                    kind,
                    Err(AgentError::Failed(format!("no {kind} agent configured"))),
                );
                continue;
            };

            let financial_threshold_eur =
                (kind == AgentKind::Financial).then_some(self.settings.financial_threshold_eur);
            units.push(WorkUnit {
                kind,
                agent,
                input: AgentInput {
                    documents: selected,
                    financial_threshold_eur,
                    cancel: cancel.child_token(),
                },
            });
        }
        units
    }

    async fn dispatch(&self, ctx: &mut PipelineContext, job: &PipelineJob) {
        let units = self.build_units(ctx, &job.cancel);
        let documents = units
            .iter()
            .map(|u| {
                let first = u
                    .input
                    .documents
                    .first()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned());
                (u.kind, (u.input.documents.len() as u64, first))
            })
            .collect();

        let mode = if self.settings.parallel_dispatch {
            DispatchMode::Parallel {
                deadline: self.settings.agent_deadline,
            }
        } else {
            DispatchMode::Sequential {
                deadline: self.settings.agent_deadline,
            }
        };

        let mut sink = DispatchProgress {
            emitter: &job.progress,
            template: ctx.stage_update(Stage::Dispatch, ""),
            documents,
            processed: 0,
        };
        let results = dispatch_agents(units, mode, &job.cancel, &mut sink).await;
        ctx.processed_documents = sink.processed;
        ctx.agent_results.extend(results);

        for (kind, result) in &ctx.agent_results {
            if let Err(e) = result {
                ctx.errors.push(format!("{} agent failed: {e}", kind.label()));
            }
        }
    }

    fn normalize(&self, ctx: &mut PipelineContext) {
        for (kind, result) in &ctx.agent_results {
            let Ok(raw) = result else { continue };
            let (status, reason) = match kind {
                AgentKind::Identity => {
                    let summary = IdentitySummary::from_raw(raw);
                    let out = (summary.extraction_status, summary.failure_reason.clone());
                    ctx.identity = Some(summary);
                    out
                }
                AgentKind::Financial => {
                    let summary = FinancialSummary::from_raw(raw, self.settings.financial_threshold_eur);
                    let out = (summary.extraction_status, summary.failure_reason.clone());
                    ctx.financial = Some(summary);
                    out
                }
                AgentKind::Academic => {
                    let summary = AcademicSummary::from_raw(raw);
                    let out = (summary.extraction_status, summary.failure_reason.clone());
                    ctx.academic = Some(summary);
                    out
                }
            };
            if status == ExtractionStatus::Failed {
                ctx.errors.push(format!(
                    "Failed to normalize {kind} result: {}",
                    reason.unwrap_or_default()
                ));
            }
        }

        ctx.completeness = self.completeness.evaluate(&ctx.batch, &ctx.agent_results);
        for decision in &ctx.completeness {
            if !decision.complete {
                ctx.warnings
                    .push(format!("Incomplete {} documents: {}", decision.category, decision.reason));
            }
        }
    }

    fn cross_validate(&self, ctx: &mut PipelineContext) {
        let input = CrossValidationInput {
            identity_name: ctx.identity.as_ref().and_then(IdentitySummary::full_name),
            identity_dob: ctx.identity.as_ref().and_then(|s| s.date_of_birth.clone()),
            financial_name: ctx.financial.as_ref().and_then(|s| s.account_holder_name.clone()),
            academic_name: ctx.academic.as_ref().and_then(|s| s.student_name.clone()),
            academic_dob: ctx.academic.as_ref().and_then(|s| s.date_of_birth.clone()),
        };
        ctx.cross_validation = Some(CrossValidator::new(self.settings.name_match_threshold).validate(&input));
    }

    fn finalize(ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        let usable = |status: Option<ExtractionStatus>| status.is_some_and(|s| s != ExtractionStatus::Failed);
        let any_usable = usable(ctx.identity.as_ref().map(|s| s.extraction_status))
            || usable(ctx.financial.as_ref().map(|s| s.extraction_status))
            || usable(ctx.academic.as_ref().map(|s| s.extraction_status));
        if !any_usable {
            let detail = if ctx.errors.is_empty() {
                "no agent was dispatched".to_string()
            } else {
                ctx.errors.join("; ")
            };
            return Err(PipelineError::NoResult(detail));
        }

        let mut documents_by_category = BTreeMap::new();
        for category in super::DocumentCategory::RECOGNIZED
            .into_iter()
            .chain([super::DocumentCategory::Unknown])
        {
            documents_by_category.insert(category.to_string(), ctx.batch.documents(category).len());
        }

        let agent_errors = ctx
            .agent_results
            .iter()
            .filter_map(|(kind, r)| r.as_ref().err().map(|e| (*kind, e.to_string())))
            .collect();

        let elapsed = ctx.started.elapsed().as_secs_f64();
        info!(
            session_id = %ctx.session_id,
            elapsed_secs = elapsed,
            errors = ctx.errors.len(),
            warnings = ctx.warnings.len(),
            "Pipeline finished"
        );

        ctx.result = Some(AnalysisResult {
            applicant_name: ctx.identity.as_ref().and_then(IdentitySummary::full_name),
            identity: ctx.identity.clone(),
            financial: ctx.financial.clone(),
            academic: ctx.academic.clone(),
            cross_validation: ctx.cross_validation.clone(),
            completeness: ctx.completeness.clone(),
            agent_errors,
            metadata: ProcessingMetadata {
                total_documents_scanned: ctx.documents.len(),
                documents_by_category,
                processing_errors: ctx.errors.clone(),
                processing_warnings: ctx.warnings.clone(),
                processing_time_seconds: elapsed,
            },
        });
        Ok(())
    }
}

impl PipelineRunner for MasterPipeline {
    fn run(&self, job: PipelineJob) -> BoxFuture<'static, Result<AnalysisResult, PipelineError>> {
        let pipeline = self.clone();
        Box::pin(async move { pipeline.execute(job).await })
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::pipeline::agents::{Agent, RawAgentOutput};
    use docverify_core::config::ClassificationStrategy;
    use serde_json::json;
    use std::sync::Arc;

    struct Fixed(Result<serde_json::Value, String>);

    impl Agent for Fixed {
        fn process(&self, _input: &AgentInput) -> Result<RawAgentOutput, AgentError> {
            self.0.clone().map(RawAgentOutput).map_err(AgentError::Failed)
        }
    }

    fn pipeline(agents: AgentRegistry, parallel: bool) -> MasterPipeline {
        MasterPipeline::new(
            PipelineSettings {
                parallel_dispatch: parallel,
                agent_deadline: Duration::from_secs(5),
                ..PipelineSettings::default()
            },
            DocumentSorter::new(ClassificationStrategy::FilenameOnly),
            agents,
        )
    }

    fn folder(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for f in files {
            std::fs::write(dir.path().join(f), b"%PDF").unwrap();
        }
        dir
    }

    fn job(dir: &std::path::Path) -> (PipelineJob, tokio::sync::mpsc::Receiver<ProgressUpdate>) {
        let (progress, rx) = ProgressEmitter::channel(64);
        (
            PipelineJob {
                session_id: "s1".into(),
                input_dir: dir.to_path_buf(),
                progress,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    fn identity_output() -> serde_json::Value {
        json!({"extracted_passport_data": {"first_name": "Jose", "last_name": "Obrien", "date_of_birth": "1990-04-12"}})
    }

    #[tokio::test]
    async fn emits_each_stage_in_order() {
        let dir = folder(&["passport.pdf"]);
        let agents = AgentRegistry::new().with(AgentKind::Identity, Arc::new(Fixed(Ok(identity_output()))));
        let (job, mut rx) = job(dir.path());

        let result = pipeline(agents, false).execute(job).await.unwrap();
        assert_eq!(result.applicant_name.as_deref(), Some("Jose Obrien"));

        let mut stages = Vec::new();
        while let Some(update) = rx.recv().await {
            if update.sub_agent.is_none() {
                stages.push(update.stage_index);
            }
        }
        assert_eq!(stages, [0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn failed_agent_is_recorded_and_others_kept() {
        let dir = folder(&["passport.pdf", "bank_statement.pdf", "degree.pdf"]);
        let agents = AgentRegistry::new()
            .with(AgentKind::Identity, Arc::new(Fixed(Ok(identity_output()))))
            .with(AgentKind::Financial, Arc::new(Fixed(Err("statement unreadable".into()))))
            .with(AgentKind::Academic, Arc::new(Fixed(Ok(json!({"student_name": "Jose Obrien"})))));
        let (job, _rx) = job(dir.path());

        let result = pipeline(agents, true).execute(job).await.unwrap();
        assert!(result.identity.is_some());
        assert!(result.academic.is_some());
        assert!(result.financial.is_none());
        assert!(
            result
                .metadata
                .processing_errors
                .iter()
                .any(|e| e.contains("Financial agent failed: statement unreadable"))
        );
        assert!(result.agent_errors.contains_key(&AgentKind::Financial));
    }

    #[tokio::test]
    async fn no_usable_output_is_no_result() {
        let dir = folder(&["passport.pdf"]);
        let agents = AgentRegistry::new().with(AgentKind::Identity, Arc::new(Fixed(Err("boom".into()))));
        let (job, _rx) = job(dir.path());

        let err = pipeline(agents, false).execute(job).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoResult(ref detail) if detail.contains("boom")));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_stage() {
        let dir = folder(&["passport.pdf"]);
        let (job, _rx) = job(dir.path());
        job.cancel.cancel();
        let err = pipeline(AgentRegistry::new(), false).execute(job).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn extra_identity_documents_warn() {
        let dir = folder(&["passport_a.pdf", "passport_b.pdf"]);
        let agents = AgentRegistry::new().with(AgentKind::Identity, Arc::new(Fixed(Ok(identity_output()))));
        let (job, _rx) = job(dir.path());

        let result = pipeline(agents, false).execute(job).await.unwrap();
        assert!(
            result
                .metadata
                .processing_warnings
                .iter()
                .any(|w| w.starts_with("Multiple identity documents found (2)"))
        );
    }
}
