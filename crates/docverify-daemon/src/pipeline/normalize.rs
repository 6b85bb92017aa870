//! Raw agent output to stable summaries, and the completeness policy.
//!
//! Raw output is validated once, here. Every field is optional; a document
//! that does not deserialize at all yields a summary with
//! [`ExtractionStatus::Failed`] rather than an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use docverify_core::config::CompletenessRuleConfig;

use super::agents::{AgentKind, RawAgentOutput};
use super::document::{DocumentBatch, DocumentCategory};
use super::fanout::AgentResults;

/// How much of a summary could be filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Success,
    Partial,
    Failed,
}

/// Three-way verdict reported by the financial and academic agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
    #[default]
    Inconclusive,
}

impl Verdict {
    fn from_code(code: Option<&str>, pass: &str, fail: &str) -> Self {
        match code.map(str::trim) {
            Some(c) if c.eq_ignore_ascii_case(pass) => Self::Pass,
            Some(c) if c.eq_ignore_ascii_case(fail) => Self::Fail,
            _ => Self::Inconclusive,
        }
    }
}

// Raw shapes. Unknown fields are ignored and every field may be absent.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawIdentity {
    extracted_passport_data: Option<RawPassportFields>,
    extracted_mrz_data: Option<RawMrz>,
    accuracy_score: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPassportFields {
    first_name: Option<String>,
    last_name: Option<String>,
    date_of_birth: Option<String>,
    sex: Option<String>,
    passport_number: Option<String>,
    issuing_country: Option<String>,
    passport_issue_date: Option<String>,
    passport_expiry_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMrz {
    document_type: Option<String>,
    raw_line1: Option<String>,
    raw_line2: Option<String>,
    checksum_results: Option<RawChecksums>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawChecksums {
    composite_valid: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFinancial {
    document_type: Option<String>,
    account_holder: Option<String>,
    bank_name: Option<String>,
    currency_detected: Option<String>,
    converted_to_eur: Option<RawConversion>,
    financial_worthiness: Option<RawWorthiness>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConversion {
    amount_eur: Option<Value>,
    original_amount: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawWorthiness {
    decision: Option<String>,
    threshold_eur: Option<Value>,
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAcademic {
    highest_qualification: Option<RawQualification>,
    evaluation: Option<RawEvaluation>,
    student_name: Option<String>,
    date_of_birth: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawQualification {
    qualification_name: Option<String>,
    institution: Option<String>,
    country: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEvaluation {
    grade_conversion: Option<RawGradeConversion>,
    semester_validation: Option<RawSemesterValidation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawGradeConversion {
    original_grade: Option<Value>,
    french_equivalent_0_20: Option<Value>,
    conversion_notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSemesterValidation {
    status: Option<String>,
}

/// Numbers arrive as JSON numbers or numeric strings.
fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percent(score: f64) -> u8 {
    score.clamp(0.0, 100.0).round() as u8
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse<T: for<'de> Deserialize<'de>>(raw: &RawAgentOutput) -> Result<T, String> {
    T::deserialize(&raw.0).map_err(|e| e.to_string())
}

/// MRZ block of an identity document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MrzSummary {
    pub document_type: Option<String>,
    pub raw_line1: Option<String>,
    pub raw_line2: Option<String>,
    pub checksum_valid: Option<bool>,
}

/// Identity document fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<String>,
    pub sex: Option<String>,
    pub document_number: Option<String>,
    pub issuing_country: Option<String>,
    pub issue_date: Option<String>,
    pub expiry_date: Option<String>,
    pub mrz: Option<MrzSummary>,
    /// 0 to 100.
    pub accuracy_score: u8,
    pub extraction_status: ExtractionStatus,
    pub failure_reason: Option<String>,
}

impl IdentitySummary {
    fn failed(reason: String) -> Self {
        Self {
            first_name: None,
            last_name: None,
            date_of_birth: None,
            sex: None,
            document_number: None,
            issuing_country: None,
            issue_date: None,
            expiry_date: None,
            mrz: None,
            accuracy_score: 0,
            extraction_status: ExtractionStatus::Failed,
            failure_reason: Some(reason),
        }
    }

    /// First and last name joined, or whichever is present.
    pub fn full_name(&self) -> Option<String> {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(one), None) | (None, Some(one)) => Some(one.to_string()),
            (None, None) => None,
        }
    }

    pub fn from_raw(raw: &RawAgentOutput) -> Self {
        let parsed: RawIdentity = match parse(raw) {
            Ok(p) => p,
            Err(e) => return Self::failed(format!("unreadable identity output: {e}")),
        };

        let accuracy_score = number(parsed.accuracy_score.as_ref()).map_or(0, percent);
        let mrz = parsed.extracted_mrz_data.map(|m| MrzSummary {
            document_type: non_empty(m.document_type),
            raw_line1: non_empty(m.raw_line1),
            raw_line2: non_empty(m.raw_line2),
            checksum_valid: m.checksum_results.and_then(|c| c.composite_valid),
        });

        let Some(fields) = parsed.extracted_passport_data else {
            let mut summary = Self::failed("No visual data extracted".into());
            summary.extraction_status = ExtractionStatus::Partial;
            summary.accuracy_score = accuracy_score;
            summary.mrz = mrz;
            return summary;
        };

        Self {
            first_name: non_empty(fields.first_name),
            last_name: non_empty(fields.last_name),
            date_of_birth: non_empty(fields.date_of_birth),
            sex: non_empty(fields.sex),
            document_number: non_empty(fields.passport_number),
            issuing_country: non_empty(fields.issuing_country),
            issue_date: non_empty(fields.passport_issue_date),
            expiry_date: non_empty(fields.passport_expiry_date),
            mrz,
            accuracy_score,
            extraction_status: ExtractionStatus::Success,
            failure_reason: None,
        }
    }
}

/// Financial document fields and the worthiness verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialSummary {
    pub document_type: Option<String>,
    pub account_holder_name: Option<String>,
    pub bank_name: Option<String>,
    pub base_currency: Option<String>,
    pub amount_original: Option<f64>,
    pub amount_eur: Option<f64>,
    pub financial_threshold_eur: f64,
    pub worthiness_status: Verdict,
    pub remarks: String,
    pub extraction_status: ExtractionStatus,
    pub failure_reason: Option<String>,
}

impl FinancialSummary {
    pub fn from_raw(raw: &RawAgentOutput, default_threshold_eur: f64) -> Self {
        let parsed: RawFinancial = match parse(raw) {
            Ok(p) => p,
            Err(e) => {
                return Self {
                    document_type: None,
                    account_holder_name: None,
                    bank_name: None,
                    base_currency: None,
                    amount_original: None,
                    amount_eur: None,
                    financial_threshold_eur: default_threshold_eur,
                    worthiness_status: Verdict::Inconclusive,
                    remarks: String::new(),
                    extraction_status: ExtractionStatus::Failed,
                    failure_reason: Some(format!("unreadable financial output: {e}")),
                };
            }
        };

        let conversion = parsed.converted_to_eur.unwrap_or_default();
        let worthiness = parsed.financial_worthiness.unwrap_or_default();
        Self {
            document_type: non_empty(parsed.document_type),
            account_holder_name: non_empty(parsed.account_holder),
            bank_name: non_empty(parsed.bank_name),
            base_currency: non_empty(parsed.currency_detected),
            amount_original: number(conversion.original_amount.as_ref()),
            amount_eur: number(conversion.amount_eur.as_ref()),
            financial_threshold_eur: number(worthiness.threshold_eur.as_ref())
                .unwrap_or(default_threshold_eur),
            worthiness_status: Verdict::from_code(worthiness.decision.as_deref(), "WORTHY", "NOT_WORTHY"),
            remarks: worthiness.reason.unwrap_or_default(),
            extraction_status: ExtractionStatus::Success,
            failure_reason: None,
        }
    }
}

/// Academic credential fields and the validation verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcademicSummary {
    pub highest_qualification: Option<String>,
    pub institution: Option<String>,
    pub country: Option<String>,
    pub student_name: Option<String>,
    pub date_of_birth: Option<String>,
    pub final_grade_original: Option<String>,
    pub french_equivalent_grade_0_20: Option<f64>,
    pub validation_status: Verdict,
    pub remarks: String,
    pub extraction_status: ExtractionStatus,
    pub failure_reason: Option<String>,
}

impl AcademicSummary {
    pub fn from_raw(raw: &RawAgentOutput) -> Self {
        let parsed: RawAcademic = match parse(raw) {
            Ok(p) => p,
            Err(e) => {
                return Self {
                    highest_qualification: None,
                    institution: None,
                    country: None,
                    student_name: None,
                    date_of_birth: None,
                    final_grade_original: None,
                    french_equivalent_grade_0_20: None,
                    validation_status: Verdict::Inconclusive,
                    remarks: String::new(),
                    extraction_status: ExtractionStatus::Failed,
                    failure_reason: Some(format!("unreadable academic output: {e}")),
                };
            }
        };

        let qualification = parsed.highest_qualification.unwrap_or_default();
        let evaluation = parsed.evaluation.unwrap_or_default();
        let grades = evaluation.grade_conversion.unwrap_or_default();
        let status = evaluation.semester_validation.and_then(|s| s.status);

        Self {
            highest_qualification: non_empty(qualification.qualification_name),
            institution: non_empty(qualification.institution),
            country: non_empty(qualification.country),
            student_name: non_empty(parsed.student_name),
            date_of_birth: non_empty(parsed.date_of_birth),
            final_grade_original: text(grades.original_grade.as_ref()),
            french_equivalent_grade_0_20: number(grades.french_equivalent_0_20.as_ref()),
            validation_status: Verdict::from_code(status.as_deref(), "VALID", "INVALID"),
            remarks: grades.conversion_notes.unwrap_or_default(),
            extraction_status: ExtractionStatus::Success,
            failure_reason: None,
        }
    }
}

/// Whether one category has enough material to be judged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletenessDecision {
    pub category: DocumentCategory,
    pub documents: usize,
    pub complete: bool,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct CompletenessRule {
    category: DocumentCategory,
    min_documents: usize,
    /// Dotted paths into the raw agent output.
    sufficient_markers: Vec<String>,
}

/// Data-driven completeness rules, one per category.
///
/// A category is complete when it has at least `min_documents` documents, or
/// when its agent's raw output carries a non-null value at any of the
/// rule's marker paths.
#[derive(Debug, Clone)]
pub struct CompletenessPolicy {
    rules: Vec<CompletenessRule>,
}

impl Default for CompletenessPolicy {
    fn default() -> Self {
        Self {
            rules: DocumentCategory::RECOGNIZED
                .into_iter()
                .map(|category| CompletenessRule {
                    category,
                    min_documents: 1,
                    sufficient_markers: Vec::new(),
                })
                .collect(),
        }
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |v, key| v.get(key))
        .filter(|v| !v.is_null())
}

impl CompletenessPolicy {
    /// Build from configuration; an empty list yields the default policy.
    pub fn from_config(rules: &[CompletenessRuleConfig]) -> docverify_core::Result<Self> {
        if rules.is_empty() {
            return Ok(Self::default());
        }
        let rules = rules
            .iter()
            .map(|r| {
                let category = DocumentCategory::parse(&r.category)
                    .filter(|c| *c != DocumentCategory::Unknown)
                    .ok_or_else(|| {
                        docverify_core::Error::Config(format!(
                            "unknown completeness category: {}",
                            r.category
                        ))
                    })?;
                Ok(CompletenessRule {
                    category,
                    min_documents: r.min_documents,
                    sufficient_markers: r.sufficient_markers.clone(),
                })
            })
            .collect::<docverify_core::Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn evaluate(&self, batch: &DocumentBatch, results: &AgentResults) -> Vec<CompletenessDecision> {
        self.rules
            .iter()
            .map(|rule| {
                let documents = batch.documents(rule.category).len();
                let raw = AgentKind::ALL
                    .into_iter()
                    .find(|k| k.category() == rule.category)
                    .and_then(|k| results.get(&k))
                    .and_then(|r| r.as_ref().ok());
                let marker = raw.and_then(|raw| {
                    rule.sufficient_markers
                        .iter()
                        .find(|m| lookup(&raw.0, m).is_some())
                });

                let (complete, reason) = if let Some(marker) = marker {
                    (true, format!("agent output provides {marker}"))
                } else if documents >= rule.min_documents {
                    (true, format!("{documents} of {} required documents present", rule.min_documents))
                } else {
                    (
                        false,
                        format!(
                            "only {documents} {} document(s), {} required",
                            rule.category, rule.min_documents
                        ),
                    )
                };
                CompletenessDecision {
                    category: rule.category,
                    documents,
                    complete,
                    reason,
                }
            })
            .collect()
    }
}
