//! Scan an input directory for supported documents.

use std::path::Path;

use tracing::{debug, warn};

use super::document::Document;
use super::error::PipelineError;

/// Extensions accepted by the scanner, lowercase.
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["pdf", "png", "jpg", "jpeg"];

/// Documents found plus anything skipped along the way.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub documents: Vec<Document>,
    pub warnings: Vec<String>,
}

/// Lowercased extension of `path` when it is one the scanner accepts.
pub fn supported_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    SUPPORTED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// List supported documents directly inside `dir`, sorted by file name.
///
/// Hidden files are ignored. Empty and oversized files are skipped with a
/// warning. A missing directory, or one with nothing usable, is an error.
pub async fn scan_documents(dir: &Path, max_file_size: u64) -> Result<ScanOutcome, PipelineError> {
    let metadata = tokio::fs::metadata(dir).await.map_err(|e| {
        PipelineError::Scan(format!("input folder {} is not readable: {e}", dir.display()))
    })?;
    if !metadata.is_dir() {
        return Err(PipelineError::Scan(format!(
            "input path {} is not a directory",
            dir.display()
        )));
    }

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| PipelineError::Scan(format!("failed to list {}: {e}", dir.display())))?;

    let mut outcome = ScanOutcome::default();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PipelineError::Scan(format!("failed to list {}: {e}", dir.display())))?
    {
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.starts_with('.') {
            continue;
        }
        let Some(extension) = supported_extension(&path) else {
            debug!(file = %file_name, "Skipping unsupported file");
            continue;
        };
        let meta = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(e) => {
                outcome.warnings.push(format!("Could not read {file_name}: {e}"));
                continue;
            }
        };

        let size_bytes = meta.len();
        if size_bytes == 0 {
            warn!(file = %file_name, "Skipping empty file");
            outcome.warnings.push(format!("File {file_name} is empty, skipping"));
            continue;
        }
        if size_bytes > max_file_size {
            warn!(file = %file_name, size_bytes, max_file_size, "Skipping oversized file");
            outcome.warnings.push(format!(
                "File {file_name} exceeds size limit ({size_bytes} > {max_file_size} bytes), skipping"
            ));
            continue;
        }

        outcome.documents.push(Document {
            path,
            file_name,
            extension,
            size_bytes,
        });
    }

    if outcome.documents.is_empty() {
        return Err(PipelineError::Scan(format!(
            "no supported documents (pdf, png, jpg, jpeg) found in {}",
            dir.display()
        )));
    }

    outcome
        .documents
        .sort_by(|a, b| a.file_name.cmp(&b.file_name));
    debug!(count = outcome.documents.len(), "Scan complete");
    Ok(outcome)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_supported_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("passport.PDF"), b"x").unwrap();
        std::fs::write(dir.path().join("bank.jpeg"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join(".hidden.pdf"), b"x").unwrap();
        std::fs::write(dir.path().join("empty.png"), b"").unwrap();

        let outcome = scan_documents(dir.path(), 1024).await.unwrap();
        let names: Vec<_> = outcome.documents.iter().map(|d| d.file_name.as_str()).collect();
        assert_eq!(names, ["bank.jpeg", "passport.PDF"]);
        assert_eq!(outcome.documents[1].extension, "pdf");
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("empty.png"));
    }

    #[tokio::test]
    async fn oversized_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.pdf"), vec![0u8; 64]).unwrap();
        std::fs::write(dir.path().join("small.pdf"), b"ok").unwrap();

        let outcome = scan_documents(dir.path(), 16).await.unwrap();
        assert_eq!(outcome.documents.len(), 1);
        assert!(outcome.warnings[0].contains("exceeds size limit"));
    }

    #[tokio::test]
    async fn missing_dir_is_scan_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_documents(&dir.path().join("absent"), 1024).await.unwrap_err();
        assert!(matches!(err, PipelineError::Scan(_)));
    }

    #[tokio::test]
    async fn dir_without_documents_is_scan_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("readme.md"), b"x").unwrap();
        let err = scan_documents(dir.path(), 1024).await.unwrap_err();
        assert!(matches!(err, PipelineError::Scan(_)));
    }
}
