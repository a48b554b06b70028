//! Scanner implementations. Real deployments point these at live sources;
//! the JSON-file scanner lets an operator (or an out-of-process fetcher)
//! hand scan payloads to the pipeline as files.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::traits::Scanner;
use crate::types::{PipelineError, RawRecord, Result, ScanOutcome, SourceType};

/// Reads one scan payload from a JSON file: either a bare array of records
/// or `{"records": [...], "errors": [...]}`.
///
/// Records that fail to parse become per-record errors, never a failed
/// cycle; a missing or unreadable file is total source unavailability.
pub struct JsonFileScanner {
    source_type: SourceType,
    path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScanPayload {
    Records(Vec<serde_json::Value>),
    Wrapped {
        records: Vec<serde_json::Value>,
        #[serde(default)]
        errors: Vec<String>,
    },
}

impl JsonFileScanner {
    pub fn new(source_type: SourceType, path: impl Into<PathBuf>) -> Self {
        Self {
            source_type,
            path: path.into(),
        }
    }
}

#[async_trait]
impl Scanner for JsonFileScanner {
    fn source_type(&self) -> SourceType {
        self.source_type
    }

    fn name(&self) -> String {
        format!("json-file:{}", self.path.display())
    }

    async fn scan(&self) -> Result<ScanOutcome> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            PipelineError::SourceUnavailable {
                source_type: self.source_type,
                message: format!("cannot read {}: {e}", self.path.display()),
            }
        })?;

        let payload: ScanPayload =
            serde_json::from_str(&raw).map_err(|e| PipelineError::SourceUnavailable {
                source_type: self.source_type,
                message: format!("invalid scan payload in {}: {e}", self.path.display()),
            })?;

        let (values, mut record_errors) = match payload {
            ScanPayload::Records(values) => (values, Vec::new()),
            ScanPayload::Wrapped { records, errors } => (records, errors),
        };

        let mut records = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            match serde_json::from_value::<RawRecord>(value) {
                Ok(record) => records.push(record),
                Err(e) => record_errors.push(format!("record {index}: {e}")),
            }
        }

        debug!(
            source_type = %self.source_type,
            records = records.len(),
            record_errors = record_errors.len(),
            "read scan payload"
        );
        Ok(ScanOutcome {
            records,
            record_errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn scan_file(contents: &str) -> Result<ScanOutcome> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let scanner = JsonFileScanner::new(SourceType::Paper, file.path());
        scanner.scan().await
    }

    #[tokio::test]
    async fn reads_bare_record_array() {
        let outcome = scan_file(
            r#"[{"title": "A paper", "link": "https://example.org/a", "published": "2025-01-03"}]"#,
        )
        .await
        .unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].title, "A paper");
        assert!(outcome.record_errors.is_empty());
    }

    #[tokio::test]
    async fn reads_wrapped_payload_with_errors() {
        let outcome = scan_file(
            r#"{"records": [{"title": "T", "link": "https://example.org"}], "errors": ["feed xyz timed out"]}"#,
        )
        .await
        .unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.record_errors, vec!["feed xyz timed out"]);
    }

    #[tokio::test]
    async fn bad_record_becomes_record_error_not_failure() {
        let outcome = scan_file(
            r#"[{"title": "ok", "link": "https://example.org"}, {"title": 42, "link": []}]"#,
        )
        .await
        .unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.record_errors.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_is_source_unavailable() {
        let scanner = JsonFileScanner::new(SourceType::Paper, "/nonexistent/scan.json");
        let err = scanner.scan().await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    }
}
