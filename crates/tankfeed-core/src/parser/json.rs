//! JSON parsing.
//!
//! Accepts a top-level array, an object holding a record array, or a single
//! object. Nested objects are flattened into dotted column names.

use super::{ParseOptions, ParsedData, Parser, Row};
use crate::{Error, Result};
use serde_json::Value;

/// Keys searched, in order, for a record array when none is configured.
const PREFERRED_KEYS: &[&str] = &["data", "records", "items", "results", "tanks", "readings"];

/// Parser for JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonParser;

impl Parser for JsonParser {
    fn parse(&self, content: &str, options: &ParseOptions) -> Result<ParsedData> {
        let document: Value =
            serde_json::from_str(content.trim()).map_err(|e| Error::parse("json", e.to_string()))?;

        let elements = match document {
            Value::Array(items) => items,
            Value::Object(mut map) => match record_key(&map, options.records_key.as_deref())? {
                Some(key) => match map.remove(&key) {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                },
                None => vec![Value::Object(map)],
            },
            scalar => vec![scalar],
        };

        let mut names: Vec<String> = Vec::new();
        let rows: Vec<Row> = elements
            .into_iter()
            .map(|element| {
                let mut row = Row::new();
                match element {
                    Value::Object(map) => flatten_into(&mut row, None, map),
                    other => {
                        row.insert("value".to_string(), other);
                    }
                }
                for key in row.keys() {
                    if !names.iter().any(|n| n == key) {
                        names.push(key.clone());
                    }
                }
                row
            })
            .collect();

        Ok(ParsedData::from_rows(rows, names))
    }
}

/// Locate the record array inside an object document.
fn record_key(map: &serde_json::Map<String, Value>, configured: Option<&str>) -> Result<Option<String>> {
    if let Some(key) = configured {
        return match map.get(key) {
            Some(Value::Array(_)) => Ok(Some(key.to_string())),
            Some(_) => Err(Error::parse(
                "json",
                format!("records key '{}' is not an array", key),
            )),
            None => Err(Error::parse(
                "json",
                format!("records key '{}' not found", key),
            )),
        };
    }

    let is_record_array =
        |v: &Value| matches!(v, Value::Array(items) if items.iter().any(Value::is_object));

    if let Some(key) = PREFERRED_KEYS
        .iter()
        .find(|k| map.get(**k).is_some_and(is_record_array))
    {
        return Ok(Some(key.to_string()));
    }

    Ok(map
        .iter()
        .find(|(_, v)| is_record_array(v))
        .map(|(k, _)| k.clone()))
}

fn flatten_into(row: &mut Row, prefix: Option<&str>, map: serde_json::Map<String, Value>) {
    for (key, value) in map {
        let name = match prefix {
            Some(p) => format!("{}.{}", p, key),
            None => key,
        };
        match value {
            Value::Object(inner) if !inner.is_empty() => flatten_into(row, Some(&name), inner),
            other => {
                row.insert(name, other);
            }
        }
    }
}
