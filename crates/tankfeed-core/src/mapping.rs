//! Field mapping from parsed rows to canonical tank records.
//!
//! A [`FieldMapping`] assigns source columns to canonical fields. Unmapped
//! columns are carried through as extras so nothing read from a source is
//! silently dropped.

use crate::parser::{parse_bool, parse_date, parse_number, ColumnDescriptor, Row};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Canonical fields of a tank reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CanonicalField {
    TankId,
    Level,
    Temperature,
    Pressure,
    Volume,
    Capacity,
    Status,
    Location,
    Alarm,
    Timestamp,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 10] = [
        CanonicalField::TankId,
        CanonicalField::Level,
        CanonicalField::Temperature,
        CanonicalField::Pressure,
        CanonicalField::Volume,
        CanonicalField::Capacity,
        CanonicalField::Status,
        CanonicalField::Location,
        CanonicalField::Alarm,
        CanonicalField::Timestamp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::TankId => "tankId",
            CanonicalField::Level => "level",
            CanonicalField::Temperature => "temperature",
            CanonicalField::Pressure => "pressure",
            CanonicalField::Volume => "volume",
            CanonicalField::Capacity => "capacity",
            CanonicalField::Status => "status",
            CanonicalField::Location => "location",
            CanonicalField::Alarm => "alarm",
            CanonicalField::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let field = match key.as_str() {
            "tankid" | "id" => CanonicalField::TankId,
            "level" => CanonicalField::Level,
            "temperature" => CanonicalField::Temperature,
            "pressure" => CanonicalField::Pressure,
            "volume" => CanonicalField::Volume,
            "capacity" => CanonicalField::Capacity,
            "status" => CanonicalField::Status,
            "location" => CanonicalField::Location,
            "alarm" => CanonicalField::Alarm,
            "timestamp" => CanonicalField::Timestamp,
            _ => return Err(Error::Mapping(format!("unknown canonical field '{}'", s))),
        };
        Ok(field)
    }
}

/// Canonical field to source column assignments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct FieldMapping(BTreeMap<CanonicalField, String>);

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(canonical field name, source column)` pairs. Any unknown
    /// field name is a mapping error.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (field, column) in pairs {
            map.insert(field.as_ref().parse::<CanonicalField>()?, column.into());
        }
        Ok(Self(map))
    }

    pub fn get(&self, field: CanonicalField) -> Option<&str> {
        self.0.get(&field).map(String::as_str)
    }

    pub fn insert(&mut self, field: CanonicalField, column: impl Into<String>) {
        self.0.insert(field, column.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CanonicalField, &str)> {
        self.0.iter().map(|(f, c)| (*f, c.as_str()))
    }

    fn mapped_columns(&self) -> HashSet<&str> {
        self.0.values().map(String::as_str).collect()
    }
}

impl TryFrom<BTreeMap<String, String>> for FieldMapping {
    type Error = Error;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self> {
        Self::from_pairs(map)
    }
}

impl From<FieldMapping> for BTreeMap<String, String> {
    fn from(mapping: FieldMapping) -> Self {
        mapping
            .0
            .into_iter()
            .map(|(f, c)| (f.as_str().to_string(), c))
            .collect()
    }
}

/// A normalized tank reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRecord {
    pub tank_id: String,
    pub level: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm: Option<bool>,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

/// Conventional identifier column names, compared after normalization.
const ID_LIKE_COLUMNS: &[&str] = &[
    "id",
    "tankid",
    "tank",
    "tankno",
    "tanknumber",
    "tankname",
    "name",
    "identifier",
    "assetid",
];

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Project parsed rows into canonical records.
///
/// Rows without a usable identifier fall back to an id-like column and then
/// to a generated UUID. Rows without a reading time are stamped with the
/// time of this call.
pub fn map_data(
    rows: &[Row],
    columns: &[ColumnDescriptor],
    mapping: &FieldMapping,
    source_id: &str,
) -> Vec<CanonicalRecord> {
    let ingested_at = Utc::now();
    let mapped = mapping.mapped_columns();

    let id_fallbacks: Vec<&str> = columns
        .iter()
        .map(|c| c.name.as_str())
        .filter(|name| ID_LIKE_COLUMNS.contains(&normalize(name).as_str()))
        .collect();

    rows.iter()
        .map(|row| {
            let field = |f: CanonicalField| mapping.get(f).and_then(|col| row.get(col)).filter(|v| !v.is_null());
            let number = |f: CanonicalField| field(f).and_then(parse_number);
            let text = |f: CanonicalField| field(f).and_then(value_text);

            let tank_id = text(CanonicalField::TankId)
                .or_else(|| {
                    id_fallbacks
                        .iter()
                        .find_map(|col| row.get(*col).and_then(value_text))
                })
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let extra = row
                .iter()
                .filter(|(k, _)| !mapped.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            CanonicalRecord {
                tank_id,
                level: number(CanonicalField::Level).unwrap_or(0.0),
                temperature: number(CanonicalField::Temperature),
                pressure: number(CanonicalField::Pressure),
                volume: number(CanonicalField::Volume),
                capacity: number(CanonicalField::Capacity),
                status: text(CanonicalField::Status),
                location: text(CanonicalField::Location),
                alarm: field(CanonicalField::Alarm).and_then(parse_bool),
                timestamp: field(CanonicalField::Timestamp)
                    .and_then(parse_date)
                    .unwrap_or(ingested_at),
                source_id: source_id.to_string(),
                extra,
            }
        })
        .collect()
}

/// Render a scalar value as trimmed non-empty text.
fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

static SUGGESTION_PATTERNS: LazyLock<Vec<(CanonicalField, Regex)>> = LazyLock::new(|| {
    [
        (
            CanonicalField::TankId,
            r"(?i)^(tank[ _-]?(id|no|num|number|name|code)?|id|identifier|asset[ _-]?id|name)$",
        ),
        (CanonicalField::Level, r"(?i)(level|fill|gauge|height)"),
        (CanonicalField::Temperature, r"(?i)temp"),
        (CanonicalField::Pressure, r"(?i)(pressure|press|psi|kpa)"),
        (
            CanonicalField::Volume,
            r"(?i)(volume|vol|qty|quantity|litres|liters|gallons)",
        ),
        (CanonicalField::Capacity, r"(?i)(capacity|cap)"),
        (CanonicalField::Status, r"(?i)(status|state|condition)"),
        (CanonicalField::Location, r"(?i)(location|site|area|zone)"),
        (CanonicalField::Alarm, r"(?i)(alarm|alert|warning)"),
        (
            CanonicalField::Timestamp,
            r"(?i)(timestamp|time|date|updated|reading[ _-]?at)",
        ),
    ]
    .into_iter()
    .filter_map(|(field, pattern)| Regex::new(pattern).ok().map(|re| (field, re)))
    .collect()
});

/// Suggest a mapping for `columns`, keeping every entry already in
/// `existing`. No column is assigned to more than one field.
pub fn suggest_mapping(columns: &[String], existing: &FieldMapping) -> FieldMapping {
    let mut suggested = existing.clone();
    let mut used: HashSet<String> = existing.mapped_columns().into_iter().map(String::from).collect();

    for (field, pattern) in SUGGESTION_PATTERNS.iter() {
        if suggested.get(*field).is_some() {
            continue;
        }
        if let Some(column) = columns
            .iter()
            .find(|c| !used.contains(c.as_str()) && pattern.is_match(c))
        {
            used.insert(column.clone());
            suggested.insert(*field, column.clone());
        }
    }

    suggested
}

/// List the columns each canonical field could match. Used by the
/// inspect command to show ambiguous headers.
pub fn suggestion_candidates(columns: &[String]) -> HashMap<CanonicalField, Vec<String>> {
    SUGGESTION_PATTERNS
        .iter()
        .map(|(field, pattern)| {
            let matches = columns.iter().filter(|c| pattern.is_match(c)).cloned().collect();
            (*field, matches)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ColumnType;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("row must be an object"),
        }
    }

    fn columns(names: &[&str]) -> Vec<ColumnDescriptor> {
        names
            .iter()
            .map(|n| ColumnDescriptor {
                name: n.to_string(),
                column_type: ColumnType::String,
            })
            .collect()
    }

    #[test]
    fn test_mapping_applies_and_coerces() {
        let mapping = FieldMapping::from_pairs([
            ("tankId", "Tank"),
            ("level", "Fill %"),
            ("alarm", "High"),
            ("timestamp", "Read At"),
        ])
        .unwrap();
        let rows = vec![row(json!({
            "Tank": "T-7",
            "Fill %": "64.5",
            "High": "yes",
            "Read At": "2024-05-01T12:00:00Z",
            "Operator": "kim"
        }))];

        let records = map_data(&rows, &columns(&["Tank", "Fill %", "High", "Read At", "Operator"]), &mapping, "src");
        let r = &records[0];
        assert_eq!(r.tank_id, "T-7");
        assert_eq!(r.level, 64.5);
        assert_eq!(r.alarm, Some(true));
        assert_eq!(r.timestamp.to_rfc3339(), "2024-05-01T12:00:00+00:00");
        assert_eq!(r.source_id, "src");
        assert_eq!(r.extra.get("Operator"), Some(&json!("kim")));
        assert!(r.extra.get("Tank").is_none());
    }

    #[test]
    fn test_missing_id_column_uses_id_like_fallback() {
        let mapping = FieldMapping::from_pairs([("tankId", "serial")]).unwrap();
        let rows = vec![row(json!({"Tank No": "42", "level": "1"}))];
        let records = map_data(&rows, &columns(&["Tank No", "level"]), &mapping, "src");
        assert_eq!(records[0].tank_id, "42");
    }

    #[test]
    fn test_missing_id_generates_identifier() {
        let rows = vec![row(json!({"reading": "3"})), row(json!({"reading": "4"}))];
        let records = map_data(&rows, &columns(&["reading"]), &FieldMapping::new(), "src");
        assert!(!records[0].tank_id.is_empty());
        assert_ne!(records[0].tank_id, records[1].tank_id);
    }

    #[test]
    fn test_level_defaults_and_ingestion_time() {
        let mapping = FieldMapping::from_pairs([("level", "lvl"), ("timestamp", "ts")]).unwrap();
        let before = Utc::now();
        let rows = vec![row(json!({"lvl": "n/a", "ts": "garbage"}))];
        let records = map_data(&rows, &columns(&["lvl", "ts"]), &mapping, "src");
        assert_eq!(records[0].level, 0.0);
        assert!(records[0].timestamp >= before);
    }

    #[test]
    fn test_unknown_field_is_mapping_error() {
        let err = FieldMapping::from_pairs([("depth", "d")]).unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));

        let parsed: std::result::Result<FieldMapping, _> =
            serde_json::from_value(json!({"tank_id": "id", "bogus": "x"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_mapping_serde_uses_canonical_names() {
        let mapping: FieldMapping = serde_json::from_value(json!({"tank_id": "ID", "Level": "L"})).unwrap();
        assert_eq!(mapping.get(CanonicalField::TankId), Some("ID"));
        assert_eq!(
            serde_json::to_value(&mapping).unwrap(),
            json!({"level": "L", "tankId": "ID"})
        );
    }

    #[test]
    fn test_suggest_mapping_respects_existing() {
        let columns: Vec<String> = ["Tank ID", "Level (m)", "Temp C", "Site", "Last Updated", "Notes"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let existing = FieldMapping::from_pairs([("location", "Notes")]).unwrap();

        let suggested = suggest_mapping(&columns, &existing);
        assert_eq!(suggested.get(CanonicalField::TankId), Some("Tank ID"));
        assert_eq!(suggested.get(CanonicalField::Level), Some("Level (m)"));
        assert_eq!(suggested.get(CanonicalField::Temperature), Some("Temp C"));
        assert_eq!(suggested.get(CanonicalField::Location), Some("Notes"));
        assert_eq!(suggested.get(CanonicalField::Timestamp), Some("Last Updated"));
    }

    #[test]
    fn test_suggest_never_reuses_a_column() {
        let columns = vec!["temp_pressure".to_string()];
        let suggested = suggest_mapping(&columns, &FieldMapping::new());
        assert_eq!(suggested.len(), 1);
    }

    #[test]
    fn test_serialized_record_is_camel_case() {
        let mapping = FieldMapping::from_pairs([("tankId", "id")]).unwrap();
        let rows = vec![row(json!({"id": "A"}))];
        let records = map_data(&rows, &columns(&["id"]), &mapping, "s1");
        let value = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(value["tankId"], json!("A"));
        assert_eq!(value["sourceId"], json!("s1"));
        assert!(value.get("temperature").is_none());
        assert!(value.get("extra").is_none());
    }
}
