//! Document classification: filename patterns with an optional external fallback.

use std::sync::Arc;

use docverify_core::config::ClassificationStrategy;
use tracing::{debug, warn};

use super::document::{Document, DocumentBatch, DocumentCategory};
use super::error::PipelineError;

/// Category decision for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: DocumentCategory,
    /// 0.0 to 1.0.
    pub confidence: f32,
    /// Text the classifier extracted while deciding, if any.
    pub extracted_text: Option<String>,
}

impl Classification {
    pub const fn unknown() -> Self {
        Self {
            category: DocumentCategory::Unknown,
            confidence: 0.0,
            extracted_text: None,
        }
    }
}

/// Classifier contract.
pub trait DocumentClassifier: Send + Sync {
    fn classify(&self, document: &Document) -> Result<Classification, PipelineError>;
}

const IDENTITY_PATTERNS: &[&str] = &["passport", "pp_", "identity", "id_card", "travel_document"];
const FINANCIAL_PATTERNS: &[&str] = &["bank", "statement", "balance", "financial", "account", "bank_letter"];
const ACADEMIC_PATTERNS: &[&str] = &[
    "transcript",
    "degree",
    "diploma",
    "certificate",
    "mark_sheet",
    "marksheet",
    "grade",
    "academic",
    "semester",
    "education",
    "qualification",
    "bachelor",
    "master",
    "phd",
];

/// Case-insensitive filename substring matcher.
///
/// Categories are tried in the order identity, financial, academic.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilenameClassifier;

impl FilenameClassifier {
    const CONFIDENCE: f32 = 0.8;

    pub fn category_for(file_name: &str) -> DocumentCategory {
        let lower = file_name.to_lowercase();
        let table = [
            (DocumentCategory::Identity, IDENTITY_PATTERNS),
            (DocumentCategory::Financial, FINANCIAL_PATTERNS),
            (DocumentCategory::Academic, ACADEMIC_PATTERNS),
        ];
        table
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| lower.contains(p)))
            .map_or(DocumentCategory::Unknown, |(category, _)| *category)
    }
}

impl DocumentClassifier for FilenameClassifier {
    fn classify(&self, document: &Document) -> Result<Classification, PipelineError> {
        let category = Self::category_for(&document.file_name);
        if category == DocumentCategory::Unknown {
            return Ok(Classification::unknown());
        }
        Ok(Classification {
            category,
            confidence: Self::CONFIDENCE,
            extracted_text: None,
        })
    }
}

/// Partition produced by [`DocumentSorter::sort`].
#[derive(Debug, Default)]
pub struct SortOutcome {
    pub batch: DocumentBatch,
    /// `(document path, text)` for classifiers that extracted text.
    pub extracted_text: Vec<(std::path::PathBuf, String)>,
    pub warnings: Vec<String>,
}

/// Applies a [`ClassificationStrategy`] over a document list.
#[derive(Clone)]
pub struct DocumentSorter {
    strategy: ClassificationStrategy,
    filename: FilenameClassifier,
    external: Option<Arc<dyn DocumentClassifier>>,
}

impl DocumentSorter {
    pub const fn new(strategy: ClassificationStrategy) -> Self {
        Self {
            strategy,
            filename: FilenameClassifier,
            external: None,
        }
    }

    #[must_use]
    pub fn with_external(mut self, classifier: Arc<dyn DocumentClassifier>) -> Self {
        self.external = Some(classifier);
        self
    }

    fn external(&self, document: &Document, warnings: &mut Vec<String>) -> Classification {
        let Some(external) = &self.external else {
            return Classification::unknown();
        };
        match external.classify(document) {
            Ok(c) => c,
            Err(e) => {
                warn!(file = %document.file_name, error = %e, "External classifier failed");
                warnings.push(format!("Could not classify {}: {e}", document.file_name));
                Classification::unknown()
            }
        }
    }

    fn classify_one(&self, document: &Document, warnings: &mut Vec<String>) -> Result<Classification, PipelineError> {
        match self.strategy {
            ClassificationStrategy::FilenameOnly => self.filename.classify(document),
            ClassificationStrategy::ExternalOnly => Ok(self.external(document, warnings)),
            ClassificationStrategy::Hybrid => {
                let by_name = self.filename.classify(document)?;
                if by_name.category == DocumentCategory::Unknown {
                    Ok(self.external(document, warnings))
                } else {
                    Ok(by_name)
                }
            }
        }
    }

    /// Classify every document.
    ///
    /// Fails when no document lands in a recognized category.
    pub fn sort(&self, documents: &[Document]) -> Result<SortOutcome, PipelineError> {
        if self.strategy == ClassificationStrategy::ExternalOnly && self.external.is_none() {
            return Err(PipelineError::Classification(
                "external classification requested but no external classifier is configured".into(),
            ));
        }

        let mut outcome = SortOutcome::default();
        for document in documents {
            let classification = self.classify_one(document, &mut outcome.warnings)?;
            debug!(
                file = %document.file_name,
                category = %classification.category,
                confidence = classification.confidence,
                "Document classified"
            );
            if let Some(text) = classification.extracted_text {
                outcome.extracted_text.push((document.path.clone(), text));
            }
            outcome.batch.push(classification.category, document.clone());
        }

        if !outcome.batch.has_recognized() {
            return Err(PipelineError::Classification(format!(
                "none of the {} documents could be classified as identity, financial or academic",
                documents.len()
            )));
        }

        for category in DocumentCategory::RECOGNIZED {
            if outcome.batch.documents(category).is_empty() {
                outcome.warnings.push(format!("No {category} documents found"));
            }
        }
        if !outcome.batch.unknown.is_empty() {
            outcome.warnings.push(format!(
                "{} document(s) could not be classified",
                outcome.batch.unknown.len()
            ));
        }
        Ok(outcome)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn doc(name: &str) -> Document {
        Document {
            path: PathBuf::from(name),
            file_name: name.to_string(),
            extension: "pdf".into(),
            size_bytes: 1,
        }
    }

    struct Fixed(DocumentCategory);

    impl DocumentClassifier for Fixed {
        fn classify(&self, _document: &Document) -> Result<Classification, PipelineError> {
            Ok(Classification {
                category: self.0,
                confidence: 0.6,
                extracted_text: Some("text".into()),
            })
        }
    }

    #[test]
    fn filename_patterns() {
        assert_eq!(FilenameClassifier::category_for("My_Passport.pdf"), DocumentCategory::Identity);
        assert_eq!(FilenameClassifier::category_for("BANK_LETTER.png"), DocumentCategory::Financial);
        assert_eq!(FilenameClassifier::category_for("semester3_marksheet.jpg"), DocumentCategory::Academic);
        assert_eq!(FilenameClassifier::category_for("scan001.pdf"), DocumentCategory::Unknown);
    }

    #[test]
    fn filename_only_reports_missing_categories() {
        let sorter = DocumentSorter::new(ClassificationStrategy::FilenameOnly);
        let outcome = sorter.sort(&[doc("passport.pdf"), doc("scan.pdf")]).unwrap();
        assert_eq!(outcome.batch.identity.len(), 1);
        assert_eq!(outcome.batch.unknown.len(), 1);
        assert!(outcome.warnings.iter().any(|w| w == "No financial documents found"));
        assert!(outcome.warnings.iter().any(|w| w == "No academic documents found"));
    }

    #[test]
    fn hybrid_falls_back_to_external_for_unknowns() {
        let sorter = DocumentSorter::new(ClassificationStrategy::Hybrid)
            .with_external(Arc::new(Fixed(DocumentCategory::Academic)));
        let outcome = sorter.sort(&[doc("passport.pdf"), doc("scan.pdf")]).unwrap();
        assert_eq!(outcome.batch.identity.len(), 1);
        assert_eq!(outcome.batch.academic[0].file_name, "scan.pdf");
        assert_eq!(outcome.extracted_text.len(), 1);
    }

    #[test]
    fn unrecognized_batch_is_rejected() {
        let sorter = DocumentSorter::new(ClassificationStrategy::Hybrid);
        let err = sorter.sort(&[doc("scan.pdf")]).unwrap_err();
        assert!(matches!(err, PipelineError::Classification(_)));
    }

    #[test]
    fn external_only_requires_classifier() {
        let sorter = DocumentSorter::new(ClassificationStrategy::ExternalOnly);
        assert!(sorter.sort(&[doc("passport.pdf")]).is_err());
    }
}
