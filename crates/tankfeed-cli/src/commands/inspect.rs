//! Inspect command implementation.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tankfeed_core::detect::detect_format;
use tankfeed_core::mapping::{suggest_mapping, suggestion_candidates, FieldMapping};
use tankfeed_core::parser::{ColumnDescriptor, ParseOptions, Row};
use tankfeed_core::source::Encoding;
use tankfeed_core::Format;

/// What to inspect and how.
#[derive(Debug, Clone)]
pub struct InspectRequest {
    pub path: PathBuf,
    pub format: Option<Format>,
    pub delimiter: Option<char>,
    pub header: bool,
    pub encoding: String,
    pub sample: usize,
}

/// Detected layout of a file, printed as JSON.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectReport {
    pub path: String,
    pub format: Format,
    pub columns: Vec<ColumnDescriptor>,
    pub row_count: usize,
    pub sample: Vec<Row>,
    pub suggested_mapping: FieldMapping,
    /// Every column matching each canonical field, for ambiguous layouts
    pub candidates: BTreeMap<&'static str, Vec<String>>,
}

/// Detect, parse and suggest a mapping for one file.
pub fn inspect(request: &InspectRequest) -> tankfeed_core::Result<InspectReport> {
    let encoding: Encoding = request.encoding.parse()?;
    let bytes = std::fs::read(&request.path)?;
    let content = encoding.decode(&bytes);

    let format = detect_format(request.format, Some(&request.path), &content)?;
    let options = ParseOptions {
        delimiter: request.delimiter,
        header: request.header,
        ..Default::default()
    };
    let parsed = format.parse(&content, &options)?;

    let names = parsed.column_names();
    let suggested_mapping = suggest_mapping(&names, &FieldMapping::default());
    let candidates = suggestion_candidates(&names)
        .into_iter()
        .map(|(field, columns)| (field.as_str(), columns))
        .collect();

    Ok(InspectReport {
        path: request.path.display().to_string(),
        format,
        row_count: parsed.rows.len(),
        sample: parsed.rows.into_iter().take(request.sample).collect(),
        columns: parsed.columns,
        suggested_mapping,
        candidates,
    })
}

/// Inspect a file and print the report.
pub fn run(request: &InspectRequest) -> Result<()> {
    let report = inspect(request)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tankfeed_core::mapping::CanonicalField;
    use tankfeed_core::parser::ColumnType;

    fn request(path: PathBuf) -> InspectRequest {
        InspectRequest {
            path,
            format: None,
            delimiter: None,
            header: true,
            encoding: "utf-8".into(),
            sample: 2,
        }
    }

    #[test]
    fn test_inspect_csv() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "Tank ID;Fill Level;Temp C").unwrap();
        writeln!(file, "T1;40;12.5").unwrap();
        writeln!(file, "T2;55;13.0").unwrap();
        writeln!(file, "T3;60;12.0").unwrap();

        let report = inspect(&request(file.path().to_path_buf())).unwrap();
        assert_eq!(report.format, Format::Delimited);
        assert_eq!(report.row_count, 3);
        assert_eq!(report.sample.len(), 2);
        assert_eq!(report.columns[1].column_type, ColumnType::Integer);
        assert_eq!(report.suggested_mapping.get(CanonicalField::TankId), Some("Tank ID"));
        assert_eq!(report.suggested_mapping.get(CanonicalField::Level), Some("Fill Level"));
        assert_eq!(report.suggested_mapping.get(CanonicalField::Temperature), Some("Temp C"));
    }

    #[test]
    fn test_inspect_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = inspect(&request(dir.path().join("absent.csv"))).unwrap_err();
        assert!(matches!(err, tankfeed_core::Error::Io(_)));
    }

    #[test]
    fn test_inspect_rejects_unknown_encoding() {
        let mut req = request(PathBuf::from("levels.csv"));
        req.encoding = "ebcdic".into();
        assert!(matches!(inspect(&req), Err(tankfeed_core::Error::Validation(_))));
    }
}
