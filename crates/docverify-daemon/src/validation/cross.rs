//! Cross-document reconciliation of names and dates of birth.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::dates::{DateComparison, compare_dates};
use super::names::{NameComparison, compare_names};

/// Tri-state comparison result. Serializes as `true`, `false` or `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum FieldMatch {
    Match,
    Mismatch,
    #[default]
    Unknown,
}

impl From<Option<bool>> for FieldMatch {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => Self::Match,
            Some(false) => Self::Mismatch,
            None => Self::Unknown,
        }
    }
}

impl From<FieldMatch> for Option<bool> {
    fn from(value: FieldMatch) -> Self {
        match value {
            FieldMatch::Match => Some(true),
            FieldMatch::Mismatch => Some(false),
            FieldMatch::Unknown => None,
        }
    }
}

/// Values pulled from the normalized summaries.
#[derive(Debug, Clone, Default)]
pub struct CrossValidationInput {
    pub identity_name: Option<String>,
    pub identity_dob: Option<String>,
    pub financial_name: Option<String>,
    pub academic_name: Option<String>,
    pub academic_dob: Option<String>,
}

/// Reconciliation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidation {
    pub name_match: FieldMatch,
    /// Mean of the pairwise scores, when any pair was compared.
    pub name_match_score: Option<f64>,
    pub dob_match: FieldMatch,
    /// One clause per comparison, in the order performed.
    pub remarks: Vec<String>,
    pub identity_name: Option<String>,
    pub financial_name: Option<String>,
    pub academic_name: Option<String>,
    pub identity_dob: Option<String>,
    pub academic_dob: Option<String>,
}

/// Compares every other source against the identity document.
#[derive(Debug, Clone, Copy)]
pub struct CrossValidator {
    name_threshold: f64,
}

impl Default for CrossValidator {
    fn default() -> Self {
        Self { name_threshold: 0.85 }
    }
}

fn present(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

impl CrossValidator {
    pub const fn new(name_threshold: f64) -> Self {
        Self { name_threshold }
    }

    pub fn validate(&self, input: &CrossValidationInput) -> CrossValidation {
        let mut remarks = Vec::new();
        let (name_match, name_match_score) = self.validate_names(input, &mut remarks);
        let dob_match = Self::validate_dob(input, &mut remarks);

        debug!(?name_match, ?name_match_score, ?dob_match, "Cross-validation complete");
        CrossValidation {
            name_match,
            name_match_score,
            dob_match,
            remarks,
            identity_name: input.identity_name.clone(),
            financial_name: input.financial_name.clone(),
            academic_name: input.academic_name.clone(),
            identity_dob: input.identity_dob.clone(),
            academic_dob: input.academic_dob.clone(),
        }
    }

    fn validate_names(&self, input: &CrossValidationInput, remarks: &mut Vec<String>) -> (FieldMatch, Option<f64>) {
        let Some(identity) = present(input.identity_name.as_ref()) else {
            remarks.push("Name not validated: identity document name missing".to_string());
            return (FieldMatch::Unknown, None);
        };

        let others = [
            ("financial", present(input.financial_name.as_ref())),
            ("academic", present(input.academic_name.as_ref())),
        ];
        let mut scores = Vec::new();
        let mut all_matched = true;
        for (source, other) in others {
            let Some(other) = other else { continue };
            match compare_names(identity, other, self.name_threshold) {
                NameComparison::Unknown => {
                    remarks.push(format!("Name not validated against {source}: name empty after normalization"));
                }
                NameComparison::Compared { matched, score } => {
                    if matched {
                        remarks.push(format!("Name matches {source} document (score {score:.2})"));
                    } else {
                        remarks.push(format!(
                            "Name mismatch with {source} document (score {score:.2}): '{identity}' vs '{other}'"
                        ));
                    }
                    all_matched &= matched;
                    scores.push(score);
                }
            }
        }

        if scores.is_empty() {
            if remarks.is_empty() {
                remarks.push("Name not validated: no other document names available".to_string());
            }
            return (FieldMatch::Unknown, None);
        }

        #[allow(clippy::cast_precision_loss)]
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        (FieldMatch::from(Some(all_matched)), Some(mean))
    }

    fn validate_dob(input: &CrossValidationInput, remarks: &mut Vec<String>) -> FieldMatch {
        let identity = present(input.identity_dob.as_ref());
        let academic = present(input.academic_dob.as_ref());
        let comparison = compare_dates(identity, academic);

        let remark = match &comparison {
            DateComparison::Unknown if identity.is_none() => {
                "Date of birth not validated: identity document date missing".to_string()
            }
            DateComparison::Unknown => "Date of birth not validated: academic document date missing".to_string(),
            DateComparison::Compared { matched: true, .. } | DateComparison::Unparsed { matched: true } => {
                "Date of birth matches academic document".to_string()
            }
            DateComparison::Compared { left, right, .. } => {
                format!("Date of birth mismatch: identity {left} vs academic {right}")
            }
            DateComparison::Unparsed { .. } => format!(
                "Date of birth mismatch: identity '{}' vs academic '{}'",
                identity.unwrap_or_default(),
                academic.unwrap_or_default()
            ),
        };
        remarks.push(remark);
        FieldMatch::from(comparison.matched())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn full_input() -> CrossValidationInput {
        CrossValidationInput {
            identity_name: Some("JOSÉ O'BRIEN".into()),
            identity_dob: Some("1990-04-12".into()),
            financial_name: Some("Jose Obrien".into()),
            academic_name: Some("Mr Jose O'Brien".into()),
            academic_dob: Some("12/04/1990".into()),
        }
    }

    #[test]
    fn all_sources_agree() {
        let result = CrossValidator::default().validate(&full_input());
        assert_eq!(result.name_match, FieldMatch::Match);
        assert!((result.name_match_score.unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(result.dob_match, FieldMatch::Match);
        assert_eq!(result.remarks.len(), 3);
        assert!(result.remarks[0].contains("financial"));
        assert!(result.remarks[1].contains("academic"));
    }

    #[test]
    fn one_mismatch_fails_names_and_averages_scores() {
        let mut input = full_input();
        input.academic_name = Some("JANE DOE".into());
        let result = CrossValidator::default().validate(&input);
        assert_eq!(result.name_match, FieldMatch::Mismatch);
        let score = result.name_match_score.unwrap();
        assert!(score < 1.0 && score > 0.0);
        assert!(result.remarks[1].starts_with("Name mismatch with academic"));
    }

    #[test]
    fn missing_data_is_unknown_not_mismatch() {
        let input = CrossValidationInput {
            identity_name: Some("Jose Obrien".into()),
            identity_dob: Some("1990-04-12".into()),
            ..CrossValidationInput::default()
        };
        let result = CrossValidator::default().validate(&input);
        assert_eq!(result.name_match, FieldMatch::Unknown);
        assert_eq!(result.name_match_score, None);
        assert_eq!(result.dob_match, FieldMatch::Unknown);
        assert_eq!(
            result.remarks,
            [
                "Name not validated: no other document names available",
                "Date of birth not validated: academic document date missing",
            ]
        );
    }

    #[test]
    fn dob_mismatch_is_reported() {
        let mut input = full_input();
        input.academic_dob = Some("1991-04-12".into());
        let result = CrossValidator::default().validate(&input);
        assert_eq!(result.dob_match, FieldMatch::Mismatch);
        assert_eq!(result.remarks[2], "Date of birth mismatch: identity 1990-04-12 vs academic 1991-04-12");
    }

    #[test]
    fn field_match_serializes_as_nullable_bool() {
        assert_eq!(serde_json::to_string(&FieldMatch::Match).unwrap(), "true");
        assert_eq!(serde_json::to_string(&FieldMatch::Unknown).unwrap(), "null");
        let back: FieldMatch = serde_json::from_str("false").unwrap();
        assert_eq!(back, FieldMatch::Mismatch);
    }
}
