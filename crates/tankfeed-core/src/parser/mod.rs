//! Parser engine.
//!
//! Each [`Format`] maps to one [`Parser`] implementation. Every parser
//! produces [`ParsedData`]: rows as JSON object maps plus column descriptors
//! with inferred types.

mod delimited;
mod fixed_width;
pub mod infer;
mod json;
mod text;
mod xml;

pub use delimited::{detect_delimiter, DelimitedParser};
pub use fixed_width::FixedWidthParser;
pub use infer::{infer_column_type, parse_bool, parse_date, parse_number};
pub use json::JsonParser;
pub use text::TextParser;
pub use xml::XmlParser;

use crate::detect::Format;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// One parsed row keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Inferred column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Integer,
    Number,
    Boolean,
    Date,
}

/// A named column and its inferred type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

/// Result of parsing one piece of content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedData {
    pub rows: Vec<Row>,
    pub columns: Vec<ColumnDescriptor>,
}

impl ParsedData {
    /// Build from rows and an ordered column list, inferring each column type.
    pub fn from_rows(rows: Vec<Row>, names: Vec<String>) -> Self {
        let columns = names
            .into_iter()
            .map(|name| {
                let column_type = infer_column_type(rows.iter().filter_map(|row| row.get(&name)));
                ColumnDescriptor { name, column_type }
            })
            .collect();
        Self { rows, columns }
    }

    /// Column names in order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Parsing options shared by all formats. Each parser reads the fields it
/// understands and ignores the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseOptions {
    /// Explicit delimiter for delimited text
    #[serde(default)]
    pub delimiter: Option<char>,

    /// Whether the first line names the columns
    #[serde(default = "default_header")]
    pub header: bool,

    /// Extension allowlist for directory sources
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Key of the record array inside a JSON object
    #[serde(default)]
    pub records_key: Option<String>,

    /// Element name of XML records
    #[serde(default)]
    pub record_tag: Option<String>,
}

fn default_header() -> bool {
    true
}

pub(crate) fn default_extensions() -> Vec<String> {
    ["csv", "tsv", "txt", "json", "xml", "dat"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            header: default_header(),
            extensions: default_extensions(),
            records_key: None,
            record_tag: None,
        }
    }
}

/// Uniform parsing contract.
pub trait Parser {
    /// Parse decoded content into rows and typed columns.
    fn parse(&self, content: &str, options: &ParseOptions) -> Result<ParsedData>;
}

impl Format {
    /// Parse `content` with the parser registered for this format.
    pub fn parse(&self, content: &str, options: &ParseOptions) -> Result<ParsedData> {
        match self {
            Format::Delimited => DelimitedParser.parse(content, options),
            Format::Json => JsonParser.parse(content, options),
            Format::Xml => XmlParser.parse(content, options),
            Format::FixedWidth => FixedWidthParser.parse(content, options),
            Format::Text => TextParser.parse(content, options),
        }
    }
}

/// Positional name for the zero-based column `index`.
pub(crate) fn positional_name(index: usize) -> String {
    format!("column_{}", index + 1)
}

/// Resolve header cells into unique column names. Blank cells get a
/// positional name; repeats get a numeric suffix.
pub(crate) fn header_names<'a>(cells: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    cells
        .into_iter()
        .enumerate()
        .map(|(i, cell)| {
            let base = match cell.trim() {
                "" => positional_name(i),
                name => name.to_string(),
            };
            let mut name = base.clone();
            let mut n = 2;
            while !seen.insert(name.clone()) {
                name = format!("{}_{}", base, n);
                n += 1;
            }
            name
        })
        .collect()
}

/// Convert a raw text cell to a row value. Empty cells become null.
pub(crate) fn cell_value(cell: &str) -> Value {
    let cell = cell.trim();
    if cell.is_empty() {
        Value::Null
    } else {
        Value::String(cell.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_names_fill_blanks_and_dedupe() {
        let names = header_names(["tank", "", "level", "tank"]);
        assert_eq!(names, vec!["tank", "column_2", "level", "tank_2"]);
    }

    #[test]
    fn test_options_deserialize_camel_case() {
        let opts: ParseOptions =
            serde_json::from_str(r#"{"delimiter":";","header":false,"recordsKey":"tanks"}"#).unwrap();
        assert_eq!(opts.delimiter, Some(';'));
        assert!(!opts.header);
        assert_eq!(opts.records_key.as_deref(), Some("tanks"));
        assert_eq!(opts.extensions, default_extensions());
    }

    #[test]
    fn test_every_format_yields_all_rows() {
        let cases = [
            (Format::Delimited, "id,level\nA,1\nB,2\nC,3\n"),
            (Format::Json, r#"[{"id":"A","level":1},{"id":"B","level":2},{"id":"C","level":3}]"#),
            (
                Format::Xml,
                "<tanks><tank><id>A</id><level>1</level></tank><tank><id>B</id><level>2</level></tank><tank><id>C</id><level>3</level></tank></tanks>",
            ),
            (Format::FixedWidth, "id   level\nA    1\nB    2\nC    3\n"),
        ];

        for (format, content) in cases {
            let parsed = format.parse(content, &ParseOptions::default()).unwrap();
            assert_eq!(parsed.rows.len(), 3, "format {}", format);
            let names = parsed.column_names();
            assert!(names.contains(&"id".to_string()), "format {}", format);
            assert!(names.contains(&"level".to_string()), "format {}", format);
        }

        let parsed = Format::Text
            .parse("A 1\nB 2\nC 3\n", &ParseOptions::default())
            .unwrap();
        assert_eq!(parsed.rows.len(), 3);
        assert_eq!(parsed.column_names(), vec!["column_1", "column_2"]);
    }
}
