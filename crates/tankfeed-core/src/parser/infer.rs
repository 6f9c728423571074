//! Best-effort column type inference and value coercion.

use super::ColumnType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Maximum non-null values sampled per column.
pub const SAMPLE_SIZE: usize = 100;

/// Share of sampled values that must match a type.
const TYPE_THRESHOLD: f64 = 0.8;

/// Share of numeric values that must be whole for an integer column.
const INTEGER_THRESHOLD: f64 = 0.9;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d.%m.%Y"];

/// Infer a column type from its values. Nulls and empty strings are ignored.
pub fn infer_column_type<'a>(values: impl IntoIterator<Item = &'a Value>) -> ColumnType {
    let sample: Vec<&Value> = values
        .into_iter()
        .filter(|v| match v {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })
        .take(SAMPLE_SIZE)
        .collect();

    if sample.is_empty() {
        return ColumnType::String;
    }

    let total = sample.len() as f64;
    let share = |count: usize| count as f64 / total;

    let numbers: Vec<f64> = sample.iter().filter_map(|v| parse_number(v)).collect();
    if share(numbers.len()) >= TYPE_THRESHOLD {
        let whole = numbers.iter().filter(|n| n.fract() == 0.0).count();
        return if whole as f64 / numbers.len() as f64 >= INTEGER_THRESHOLD {
            ColumnType::Integer
        } else {
            ColumnType::Number
        };
    }

    let booleans = sample.iter().filter(|v| parse_bool(v).is_some()).count();
    if share(booleans) >= TYPE_THRESHOLD {
        return ColumnType::Boolean;
    }

    let dates = sample.iter().filter(|v| parse_date(v).is_some()).count();
    if share(dates) >= TYPE_THRESHOLD {
        return ColumnType::Date;
    }

    ColumnType::String
}

/// Parse a finite number from a JSON number or numeric string.
pub fn parse_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Parse a boolean from a JSON bool, 0/1 number, or boolean token.
pub fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_f64()? {
            x if x == 1.0 => Some(true),
            x if x == 0.0 => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Parse a calendar date or timestamp. Values without an offset are UTC.
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    let Value::String(s) = value else {
        return None;
    };
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strings(values: &[&str]) -> Vec<Value> {
        values.iter().map(|s| json!(s)).collect()
    }

    #[test]
    fn test_mixed_numbers_are_number() {
        let values = strings(&["1", "2", "3.5", "4"]);
        assert_eq!(infer_column_type(&values), ColumnType::Number);
    }

    #[test]
    fn test_whole_numbers_are_integer() {
        let values = strings(&["1", "2", "3", "4"]);
        assert_eq!(infer_column_type(&values), ColumnType::Integer);
    }

    #[test]
    fn test_boolean_tokens() {
        let values = strings(&["yes", "No", "ON", "off", "true"]);
        assert_eq!(infer_column_type(&values), ColumnType::Boolean);
    }

    #[test]
    fn test_dates() {
        let values = strings(&["2024-01-05", "2024-02-10T08:00:00Z", "2024/03/01 12:00:00"]);
        assert_eq!(infer_column_type(&values), ColumnType::Date);
    }

    #[test]
    fn test_nulls_ignored_and_empty_is_string() {
        let values = vec![Value::Null, json!(""), json!("7"), json!(8)];
        assert_eq!(infer_column_type(&values), ColumnType::Integer);

        let empty = vec![Value::Null, json!("  ")];
        assert_eq!(infer_column_type(&empty), ColumnType::String);
    }

    #[test]
    fn test_below_threshold_is_string() {
        let values = strings(&["1", "two", "three", "4", "five"]);
        assert_eq!(infer_column_type(&values), ColumnType::String);
    }

    #[test]
    fn test_non_finite_rejected() {
        assert_eq!(parse_number(&json!("NaN")), None);
        assert_eq!(parse_number(&json!("inf")), None);
        assert_eq!(parse_number(&json!(" 42.5 ")), Some(42.5));
    }

    #[test]
    fn test_parse_date_without_offset_is_utc() {
        let dt = parse_date(&json!("2024-06-01 10:30:00")).unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-06-01T10:30:00+00:00");
    }
}
