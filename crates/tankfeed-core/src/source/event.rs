//! Events emitted by the source registry.

use crate::detect::Format;
use crate::mapping::CanonicalRecord;
use crate::parser::ColumnDescriptor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Longest origin string carried in batch metadata.
const MAX_ORIGIN_LEN: usize = 120;

/// Details of one successful ingestion cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    pub format: Format,
    pub columns: Vec<ColumnDescriptor>,
    pub row_count: usize,
    /// File path or URL the batch was read from, shortened for display
    pub origin: String,
    pub duration_ms: u64,
    pub ingested_at: DateTime<Utc>,
}

/// Output of the registry, one per ingestion cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SourceEvent {
    #[serde(rename_all = "camelCase")]
    Data {
        source_id: String,
        records: Arc<Vec<CanonicalRecord>>,
        metadata: BatchMetadata,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        source_id: String,
        /// Error category, see [`crate::Error::category`]
        category: String,
        error: String,
    },
}

impl SourceEvent {
    pub fn source_id(&self) -> &str {
        match self {
            SourceEvent::Data { source_id, .. } | SourceEvent::Error { source_id, .. } => source_id,
        }
    }
}

/// Shorten a path or URL by keeping its tail.
pub(crate) fn truncate_origin(origin: &str) -> String {
    let count = origin.chars().count();
    if count <= MAX_ORIGIN_LEN {
        return origin.to_string();
    }
    let tail: String = origin.chars().skip(count - (MAX_ORIGIN_LEN - 3)).collect();
    format!("...{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_origin_keeps_tail() {
        let long = format!("/mnt/{}/levels.csv", "a".repeat(200));
        let short = truncate_origin(&long);
        assert_eq!(short.chars().count(), MAX_ORIGIN_LEN);
        assert!(short.starts_with("..."));
        assert!(short.ends_with("/levels.csv"));
        assert_eq!(truncate_origin("/tmp/x.csv"), "/tmp/x.csv");
    }

    #[test]
    fn test_error_event_serialization() {
        let event = SourceEvent::Error {
            source_id: "yard".into(),
            category: "parse".into(),
            error: "bad".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["sourceId"], "yard");
    }
}
