//! One ingestion cycle from raw bytes to canonical records.

use crate::detect::{detect_format, Format};
use crate::mapping::{map_data, suggest_mapping, CanonicalRecord};
use crate::parser::ColumnDescriptor;
use crate::source::SourceDescriptor;
use crate::Result;
use std::path::Path;
use tracing::debug;

/// Result of processing one read.
#[derive(Debug, Clone)]
pub struct ProcessedBatch {
    pub format: Format,
    pub columns: Vec<ColumnDescriptor>,
    pub records: Vec<CanonicalRecord>,
}

/// Decode, detect, parse and map `bytes` read for `descriptor`.
///
/// `path` is the file the bytes came from, used for extension-based format
/// detection. Remote reads pass the URL path. Mapping entries the descriptor
/// leaves unset are filled from the column names; configured entries win.
pub fn process(descriptor: &SourceDescriptor, path: Option<&Path>, bytes: &[u8]) -> Result<ProcessedBatch> {
    let content = descriptor.text_encoding().decode(bytes);
    let format = detect_format(descriptor.format.explicit(), path, &content)?;
    let parsed = format.parse(&content, &descriptor.options)?;

    debug!(
        source_id = %descriptor.id,
        format = %format,
        rows = parsed.rows.len(),
        columns = parsed.columns.len(),
        "Parsed content"
    );

    let mapping = suggest_mapping(&parsed.column_names(), &descriptor.mapping);
    let records = map_data(&parsed.rows, &parsed.columns, &mapping, &descriptor.id);
    Ok(ProcessedBatch {
        format,
        columns: parsed.columns,
        records,
    })
}
