//! Generic whitespace-tokenized text.

use super::{cell_value, positional_name, ParseOptions, ParsedData, Parser, Row};

/// Parser of last resort: each non-empty line is a row of whitespace tokens.
/// The header flag is ignored since token positions carry no names.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextParser;

impl Parser for TextParser {
    fn parse(&self, content: &str, _options: &ParseOptions) -> crate::Result<ParsedData> {
        let rows: Vec<Row> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                line.split_whitespace()
                    .enumerate()
                    .map(|(i, token)| (positional_name(i), cell_value(token)))
                    .collect()
            })
            .collect();

        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
        let names = (0..width).map(positional_name).collect();
        Ok(ParsedData::from_rows(rows, names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tokens_by_position() {
        let parsed = TextParser
            .parse("T1 45.2 ok\n\nT2 50\n", &ParseOptions::default())
            .unwrap();
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.column_names(), vec!["column_1", "column_2", "column_3"]);
        assert_eq!(parsed.rows[0]["column_3"], json!("ok"));
        assert!(parsed.rows[1].get("column_3").is_none());
    }
}
