//! Fixed-width column parsing.

use super::{cell_value, header_names, positional_name, ParseOptions, ParsedData, Parser, Row};
use crate::detect::{column_ranges, sample_lines};

/// Lines inspected when deriving column boundaries.
const BOUNDARY_SAMPLE_LINES: usize = 20;

/// Parser for whitespace-aligned columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedWidthParser;

impl Parser for FixedWidthParser {
    fn parse(&self, content: &str, options: &ParseOptions) -> crate::Result<ParsedData> {
        let lines: Vec<&str> = content
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .collect();

        let ranges = column_ranges(&sample_lines(content, BOUNDARY_SAMPLE_LINES));
        let mut lines = lines.into_iter();

        let names = if options.header {
            match lines.next() {
                Some(header) => {
                    let cells = slice_line(header, &ranges);
                    header_names(cells.iter().map(|c| c.as_deref().unwrap_or("")))
                }
                None => Vec::new(),
            }
        } else {
            (0..ranges.len()).map(positional_name).collect()
        };

        let rows = lines
            .map(|line| {
                let mut row = Row::new();
                for (name, cell) in names.iter().zip(slice_line(line, &ranges)) {
                    if let Some(cell) = cell {
                        row.insert(name.clone(), cell_value(&cell));
                    }
                }
                row
            })
            .collect();

        Ok(ParsedData::from_rows(rows, names))
    }
}

/// Cut `line` at the column ranges. A range starting past the end of the
/// line yields `None`; the last range runs to the end of the line.
fn slice_line(line: &str, ranges: &[(usize, usize)]) -> Vec<Option<String>> {
    let chars: Vec<char> = line.chars().collect();
    ranges
        .iter()
        .enumerate()
        .map(|(i, &(start, end))| {
            if start >= chars.len() {
                return None;
            }
            let end = if i + 1 == ranges.len() {
                chars.len()
            } else {
                end.min(chars.len())
            };
            Some(chars[start..end].iter().collect::<String>().trim().to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ColumnType;
    use serde_json::json;

    const REPORT: &str = "\
TANK    LEVEL   TEMP
T-01    45.20   20.1
T-02     5.00   19.8
T-03    12.75
";

    #[test]
    fn test_header_names_columns() {
        let parsed = FixedWidthParser.parse(REPORT, &ParseOptions::default()).unwrap();
        assert_eq!(parsed.column_names(), vec!["TANK", "LEVEL", "TEMP"]);
        assert_eq!(parsed.rows.len(), 3);
        assert_eq!(parsed.rows[1]["LEVEL"], json!("5.00"));
        assert_eq!(parsed.columns[1].column_type, ColumnType::Number);
    }

    #[test]
    fn test_short_line_leaves_trailing_unset() {
        let parsed = FixedWidthParser.parse(REPORT, &ParseOptions::default()).unwrap();
        assert!(parsed.rows[2].get("TEMP").is_none());
        assert_eq!(parsed.rows[2]["TANK"], json!("T-03"));
    }

    #[test]
    fn test_without_header() {
        let options = ParseOptions {
            header: false,
            ..Default::default()
        };
        let parsed = FixedWidthParser
            .parse("A    1\nB    2\n", &options)
            .unwrap();
        assert_eq!(parsed.column_names(), vec!["column_1", "column_2"]);
        assert_eq!(parsed.rows.len(), 2);
    }

    #[test]
    fn test_last_column_runs_to_end() {
        let ranges = vec![(0, 2), (4, 6)];
        let cells = slice_line("ab  cdefgh", &ranges);
        assert_eq!(cells[1].as_deref(), Some("cdefgh"));
    }
}
