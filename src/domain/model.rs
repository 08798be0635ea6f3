use crate::domain::schema::Schema;
use crate::utils::error::{EtlError, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A row is positionally aligned to the schema of the cursor that produced it.
pub type Row = Vec<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Boolean,
    Int,
    Double,
    String,
    Date,
    DateTime,
    Json,
    Node,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::Int => "int",
            DataType::Double => "double",
            DataType::String => "string",
            DataType::Date => "date",
            DataType::DateTime => "datetime",
            DataType::Json => "json",
            DataType::Node => "node",
        }
    }

    pub fn parse_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Some(DataType::Boolean),
            "int" | "integer" | "long" => Some(DataType::Int),
            "double" | "float" | "decimal" => Some(DataType::Double),
            "string" | "text" => Some(DataType::String),
            "date" => Some(DataType::Date),
            "datetime" | "timestamp" => Some(DataType::DateTime),
            "json" => Some(DataType::Json),
            "node" => Some(DataType::Node),
            _ => None,
        }
    }

    /// Parses text (from a flat file or configuration) into a value of this type.
    /// Empty text is null.
    pub fn parse(&self, column: &str, text: &str) -> Result<Value> {
        if text.is_empty() {
            return Ok(Value::Null);
        }
        let fail = |reason: String| EtlError::Conversion {
            column: column.to_string(),
            value: text.to_string(),
            data_type: self.as_str().to_string(),
            reason,
        };
        match self {
            DataType::Boolean => match text.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Ok(Value::Boolean(true)),
                "false" | "0" | "no" | "n" => Ok(Value::Boolean(false)),
                _ => Err(fail("not a boolean".to_string())),
            },
            DataType::Int => text
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|e| fail(e.to_string())),
            DataType::Double => text
                .trim()
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|e| fail(e.to_string())),
            DataType::String => Ok(Value::String(text.to_string())),
            DataType::Date => NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|e| fail(e.to_string())),
            DataType::DateTime => parse_date_time(text.trim())
                .map(Value::DateTime)
                .ok_or_else(|| fail("not a date/time".to_string())),
            DataType::Json => serde_json::from_str(text)
                .map(Value::Json)
                .map_err(|e| fail(e.to_string())),
            DataType::Node => Err(fail("node columns cannot be parsed from text".to_string())),
        }
    }

    /// Converts a value to this type, parsing strings and widening numbers.
    pub fn convert(&self, column: &str, value: &Value) -> Result<Value> {
        let fail = || EtlError::Conversion {
            column: column.to_string(),
            value: value.to_string(),
            data_type: self.as_str().to_string(),
            reason: format!("incompatible {} value", value.type_name()),
        };
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (_, Value::String(s)) if *self != DataType::String => self.parse(column, s),
            (DataType::Boolean, Value::Boolean(_))
            | (DataType::Int, Value::Int(_))
            | (DataType::Double, Value::Double(_))
            | (DataType::String, Value::String(_))
            | (DataType::Date, Value::Date(_))
            | (DataType::DateTime, Value::DateTime(_))
            | (DataType::Json, Value::Json(_))
            | (DataType::Node, Value::Node(_)) => Ok(value.clone()),
            (DataType::Int, Value::Double(d)) if d.fract() == 0.0 => Ok(Value::Int(*d as i64)),
            (DataType::Int, Value::Boolean(b)) => Ok(Value::Int(i64::from(*b))),
            (DataType::Double, Value::Int(i)) => Ok(Value::Double(*i as f64)),
            (DataType::DateTime, Value::Date(d)) => Ok(Value::DateTime(d.and_time(NaiveTime::MIN))),
            (DataType::Date, Value::DateTime(dt)) => Ok(Value::Date(dt.date())),
            (DataType::String, Value::Node(_)) => Err(fail()),
            (DataType::String, v) => Ok(Value::String(v.to_string())),
            (DataType::Json, v) => Ok(Value::Json(serde_json::Value::String(v.to_string()))),
            _ => Err(fail()),
        }
    }
}

fn parse_date_time(text: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

/// Rows materialised into a child cursor, the payload of a node column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub schema: Schema,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        Self { schema, rows }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    Double(f64),
    String(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Json(serde_json::Value),
    Node(Arc<Table>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Json(_) => "json",
            Value::Node(_) => "node",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Double(d) if d.fract() == 0.0 => Some(*d as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Semantic comparison. Null sorts before any other value and equals only null;
    /// numbers compare across int/double and dates against date/times.
    /// Returns `None` when the two values have no meaningful order.
    pub fn try_compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_)) => {
                let (a, b) = (self.as_f64()?, other.as_f64()?);
                Some(a.total_cmp(&b))
            }
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::DateTime(b)) => Some(a.and_time(NaiveTime::MIN).cmp(b)),
            (Value::DateTime(a), Value::Date(b)) => Some(a.cmp(&b.and_time(NaiveTime::MIN))),
            (Value::Json(a), Value::Json(b)) => Some(a.to_string().cmp(&b.to_string())),
            _ => None,
        }
    }

    /// [`Value::try_compare`] that raises a typed error naming the column and both values.
    pub fn compare(&self, other: &Value, transform: &str, column: &str) -> Result<Ordering> {
        self.try_compare(other)
            .ok_or_else(|| EtlError::ValueComparison {
                transform: transform.to_string(),
                column: column.to_string(),
                left: self.to_string(),
                right: other.to_string(),
            })
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Int(_) => 2,
            Value::Double(_) => 3,
            Value::String(_) => 4,
            Value::Date(_) => 5,
            Value::DateTime(_) => 6,
            Value::Json(_) => 7,
            Value::Node(_) => 8,
        }
    }
}

/// Deterministic total order (type rank first, then value). Used for map keys,
/// not for semantic ordering.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Node(a), Value::Node(b)) => a.rows.len().cmp(&b.rows.len()),
            _ => match self.type_rank().cmp(&other.type_rank()) {
                Ordering::Equal => self.try_compare(other).unwrap_or(Ordering::Equal),
                unequal => unequal,
            },
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Node(a), Value::Node(b)) => a == b,
            _ => self.cmp(other) == Ordering::Equal,
        }
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::String(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            Value::Json(j) => write!(f, "{}", j),
            Value::Node(t) => write!(f, "[{} rows]", t.rows.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Formats a key tuple for error messages, e.g. `[1, abc]`.
pub fn format_key(values: &[Value]) -> String {
    let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semantic_compare_is_null_aware() {
        assert_eq!(Value::Null.try_compare(&Value::Null), Some(Ordering::Equal));
        assert_eq!(Value::Null.try_compare(&Value::Int(0)), Some(Ordering::Less));
        assert_eq!(Value::Int(2).try_compare(&Value::Double(1.5)), Some(Ordering::Greater));
        assert_eq!(Value::Int(1).try_compare(&Value::from("1")), None);
    }

    #[test]
    fn test_compare_error_names_column_and_values() {
        let err = Value::Int(1)
            .compare(&Value::from("x"), "delta", "amount")
            .unwrap_err();
        match err {
            EtlError::ValueComparison { column, left, right, .. } => {
                assert_eq!(column, "amount");
                assert_eq!(left, "1");
                assert_eq!(right, "x");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_dates_compare_with_date_times() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let dt = d.and_hms_opt(10, 0, 0).unwrap();
        assert_eq!(Value::Date(d).try_compare(&Value::DateTime(dt)), Some(Ordering::Less));
    }

    #[test]
    fn test_parse_and_convert() {
        assert_eq!(DataType::Int.parse("id", "42").unwrap(), Value::Int(42));
        assert_eq!(DataType::Int.parse("id", "").unwrap(), Value::Null);
        assert!(DataType::Int.parse("id", "forty").is_err());
        assert_eq!(
            DataType::DateTime.parse("at", "2024-03-01").unwrap(),
            Value::DateTime(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_time(NaiveTime::MIN))
        );
        assert_eq!(
            DataType::Double.convert("amount", &Value::Int(3)).unwrap(),
            Value::Double(3.0)
        );
        assert_eq!(
            DataType::String.convert("code", &Value::Int(7)).unwrap(),
            Value::from("7")
        );
    }

    #[test]
    fn test_total_order_is_deterministic_across_types() {
        let mut values = vec![Value::from("b"), Value::Int(3), Value::Null, Value::Double(1.0)];
        values.sort();
        assert_eq!(values[0], Value::Null);
        assert_eq!(values[1], Value::Int(3));
        assert_eq!(values[3], Value::from("b"));
    }
}
