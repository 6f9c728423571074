//! Delimiter-separated text parsing on top of the `csv` crate.

use super::{cell_value, header_names, positional_name, ParseOptions, ParsedData, Parser, Row};
use crate::detect::{sample_lines, CANDIDATE_DELIMITERS};
use crate::{Error, Result};
use tracing::debug;

const DELIMITER_SAMPLE_LINES: usize = 5;

/// Parser for CSV, TSV and other single-character delimited text.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelimitedParser;

/// Pick the most likely delimiter for `content`.
///
/// Each candidate scores its occurrence count on the first line, doubled
/// when every sampled line has the same count. A shared top score, or no
/// candidate at all, yields a comma.
pub fn detect_delimiter(content: &str) -> char {
    let lines = sample_lines(content, DELIMITER_SAMPLE_LINES);
    let Some(first) = lines.first() else {
        return ',';
    };

    let scores: Vec<(char, usize)> = CANDIDATE_DELIMITERS
        .into_iter()
        .map(|candidate| {
            let count = first.matches(candidate).count();
            let consistent = lines.iter().all(|l| l.matches(candidate).count() == count);
            (candidate, if consistent { count * 2 } else { count })
        })
        .collect();

    let best = scores.iter().map(|(_, s)| *s).max().unwrap_or(0);
    if best == 0 {
        return ',';
    }

    let mut leaders = scores.iter().filter(|(_, s)| *s == best);
    match (leaders.next(), leaders.next()) {
        (Some((c, _)), None) => *c,
        _ => ',',
    }
}

impl Parser for DelimitedParser {
    fn parse(&self, content: &str, options: &ParseOptions) -> Result<ParsedData> {
        let delimiter = options.delimiter.unwrap_or_else(|| detect_delimiter(content));
        if !delimiter.is_ascii() {
            return Err(Error::parse(
                "delimited",
                format!("delimiter '{}' is not a single-byte character", delimiter),
            ));
        }

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter as u8)
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let mut records = Vec::new();
        for record in reader.records() {
            records.push(record?);
        }

        let mut records = records.into_iter();
        let header: Option<csv::StringRecord> = if options.header { records.next() } else { None };
        let rows: Vec<csv::StringRecord> = records.collect();
        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);

        // Cells past the header width get positional names
        let names = match header {
            Some(header) => {
                if width > header.len() {
                    debug!(
                        header_columns = header.len(),
                        row_columns = width,
                        "Rows wider than header, naming extra columns positionally"
                    );
                }
                let cells = header.iter().chain(std::iter::repeat("")).take(width.max(header.len()));
                header_names(cells)
            }
            None => (0..width).map(positional_name).collect(),
        };

        let rows = rows
            .iter()
            .map(|record| {
                let mut row = Row::new();
                for (name, cell) in names.iter().zip(record.iter()) {
                    row.insert(name.clone(), cell_value(cell));
                }
                row
            })
            .collect();

        Ok(ParsedData::from_rows(rows, names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ColumnType;
    use serde_json::json;

    #[test]
    fn test_detect_semicolon() {
        let content = "tank;level;temp\nT1;45.2;20.1\nT2;50.0;19.8\n";
        assert_eq!(detect_delimiter(content), ';');
    }

    #[test]
    fn test_detect_tab_and_pipe() {
        assert_eq!(detect_delimiter("a\tb\tc\n1\t2\t3"), '\t');
        assert_eq!(detect_delimiter("a|b\n1|2"), '|');
    }

    #[test]
    fn test_detect_tie_defaults_to_comma() {
        assert_eq!(detect_delimiter("a;b|c\n1;2|3"), ',');
        assert_eq!(detect_delimiter("just words here"), ',');
        assert_eq!(detect_delimiter(""), ',');
    }

    #[test]
    fn test_parse_with_header_and_quotes() {
        let content = "id,level,location\n\"T-1\",45.5,\"North, yard\"\nT-2,12,South\n";
        let parsed = DelimitedParser.parse(content, &ParseOptions::default()).unwrap();

        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0]["location"], json!("North, yard"));
        assert_eq!(parsed.rows[1]["id"], json!("T-2"));
        assert_eq!(parsed.columns[1].column_type, ColumnType::Number);
    }

    #[test]
    fn test_parse_without_header_uses_positional_names() {
        let options = ParseOptions {
            header: false,
            ..Default::default()
        };
        let parsed = DelimitedParser.parse("A,1\nB,2,extra\n", &options).unwrap();
        assert_eq!(parsed.column_names(), vec!["column_1", "column_2", "column_3"]);
        assert_eq!(parsed.rows.len(), 2);
        assert!(parsed.rows[0].get("column_3").is_none());
    }

    #[test]
    fn test_cells_past_header_get_positional_names() {
        let content = "id,level\nT1,40,north\nT2,41\n";
        let parsed = DelimitedParser.parse(content, &ParseOptions::default()).unwrap();
        assert_eq!(parsed.column_names(), vec!["id", "level", "column_3"]);
        assert_eq!(parsed.rows[0]["column_3"], json!("north"));
        assert!(parsed.rows[1].get("column_3").is_none());
    }

    #[test]
    fn test_short_rows_leave_fields_unset() {
        let content = "id,level,temp\nT1,40\nT2,41,19\n";
        let parsed = DelimitedParser.parse(content, &ParseOptions::default()).unwrap();
        assert_eq!(parsed.rows.len(), 2);
        assert!(parsed.rows[0].get("temp").is_none());
        assert_eq!(parsed.rows[1]["temp"], json!("19"));
    }

    #[test]
    fn test_empty_cells_are_null() {
        let parsed = DelimitedParser
            .parse("id,level\nT1,\n", &ParseOptions::default())
            .unwrap();
        assert_eq!(parsed.rows[0]["level"], serde_json::Value::Null);
    }

    #[test]
    fn test_explicit_delimiter_overrides_detection() {
        let options = ParseOptions {
            delimiter: Some(':'),
            ..Default::default()
        };
        let parsed = DelimitedParser.parse("id:level\nT1:3\n", &options).unwrap();
        assert_eq!(parsed.rows[0]["level"], json!("3"));
    }
}
