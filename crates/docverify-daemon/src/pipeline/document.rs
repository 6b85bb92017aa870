//! Documents and their category partition.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A supported file found in a session's upload directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub path: PathBuf,
    pub file_name: String,
    /// Lowercase extension without the dot.
    pub extension: String,
    pub size_bytes: u64,
}

/// Document category decided by classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentCategory {
    Identity,
    Financial,
    Academic,
    Unknown,
}

impl DocumentCategory {
    pub const RECOGNIZED: [Self; 3] = [Self::Identity, Self::Financial, Self::Academic];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Financial => "financial",
            Self::Academic => "academic",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" | "passport" => Some(Self::Identity),
            "financial" => Some(Self::Financial),
            "academic" | "education" => Some(Self::Academic),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Documents partitioned by category, in scan order within each category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentBatch {
    pub identity: Vec<Document>,
    pub financial: Vec<Document>,
    pub academic: Vec<Document>,
    pub unknown: Vec<Document>,
}

impl DocumentBatch {
    pub fn push(&mut self, category: DocumentCategory, document: Document) {
        self.category_mut(category).push(document);
    }

    pub fn documents(&self, category: DocumentCategory) -> &[Document] {
        match category {
            DocumentCategory::Identity => &self.identity,
            DocumentCategory::Financial => &self.financial,
            DocumentCategory::Academic => &self.academic,
            DocumentCategory::Unknown => &self.unknown,
        }
    }

    fn category_mut(&mut self, category: DocumentCategory) -> &mut Vec<Document> {
        match category {
            DocumentCategory::Identity => &mut self.identity,
            DocumentCategory::Financial => &mut self.financial,
            DocumentCategory::Academic => &mut self.academic,
            DocumentCategory::Unknown => &mut self.unknown,
        }
    }

    /// At least one of identity, financial or academic is non-empty.
    pub fn has_recognized(&self) -> bool {
        DocumentCategory::RECOGNIZED
            .iter()
            .any(|c| !self.documents(*c).is_empty())
    }

    pub fn len(&self) -> usize {
        self.identity.len() + self.financial.len() + self.academic.len() + self.unknown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn doc(name: &str) -> Document {
        Document {
            path: PathBuf::from(name),
            file_name: name.to_string(),
            extension: "pdf".into(),
            size_bytes: 10,
        }
    }

    #[test]
    fn unknown_only_batch_is_unrecognized() {
        let mut batch = DocumentBatch::default();
        batch.push(DocumentCategory::Unknown, doc("scan.pdf"));
        assert!(!batch.has_recognized());
        batch.push(DocumentCategory::Academic, doc("degree.pdf"));
        assert!(batch.has_recognized());
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn category_aliases() {
        assert_eq!(DocumentCategory::parse("Passport"), Some(DocumentCategory::Identity));
        assert_eq!(DocumentCategory::parse("education"), Some(DocumentCategory::Academic));
        assert_eq!(DocumentCategory::parse("other"), None);
    }
}
