//! Typed item values and their two-column storage form.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::db::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Num,
    Bool,
    Str,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Num => "num",
            ValueKind::Bool => "bool",
            ValueKind::Str => "str",
        }
    }
}

impl Default for ValueKind {
    fn default() -> Self {
        ValueKind::Num
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueKind {
    type Err = StoreError;

    fn from_str(value: &str) -> StoreResult<Self> {
        match value {
            "num" => Ok(ValueKind::Num),
            "bool" => Ok(ValueKind::Bool),
            "str" => Ok(ValueKind::Str),
            other => Err(StoreError::BadValue(format!("unknown value kind '{other}'"))),
        }
    }
}

/// A single item value. Variant order matters for untagged decoding:
/// JSON `true` must land in `Bool`, not be rejected by `Num`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Num(_) => ValueKind::Num,
            Value::Bool(_) => ValueKind::Bool,
            Value::Str(_) => ValueKind::Str,
        }
    }

    /// Numeric view used by the aggregates; strings and non-finite numbers
    /// have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Num(v) if v.is_finite() => Some(*v),
            Value::Num(_) => None,
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(_) => None,
        }
    }

    pub fn is_truthy(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            other => other.as_f64().map(|v| v != 0.0),
        }
    }

    /// Converts a host-delivered value into the representation of `kind`.
    pub fn coerce(self, kind: ValueKind) -> StoreResult<Value> {
        match (kind, self) {
            (ValueKind::Num, Value::Num(v)) => Ok(Value::Num(v)),
            (ValueKind::Num, Value::Bool(b)) => Ok(Value::Num(if b { 1.0 } else { 0.0 })),
            (ValueKind::Num, Value::Str(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::Num)
                .map_err(|_| StoreError::BadValue(format!("'{s}' is not numeric"))),
            (ValueKind::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (ValueKind::Bool, Value::Num(v)) => Ok(Value::Bool(v != 0.0)),
            (ValueKind::Bool, Value::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "off" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(StoreError::BadValue(format!("'{s}' is not a boolean"))),
            },
            (ValueKind::Str, Value::Str(s)) => Ok(Value::Str(s)),
            (ValueKind::Str, other) => Ok(Value::Str(other.to_string())),
        }
    }

    /// Splits into the `(value_num, value_str)` column pair.
    pub(crate) fn to_columns(&self) -> (Option<f64>, Option<String>) {
        match self {
            Value::Num(v) => (Some(*v), None),
            Value::Bool(b) => (Some(if *b { 1.0 } else { 0.0 }), None),
            Value::Str(s) => (None, Some(s.clone())),
        }
    }

    pub(crate) fn from_columns(
        kind: ValueKind,
        value_num: Option<f64>,
        value_str: Option<String>,
    ) -> StoreResult<Value> {
        match kind {
            ValueKind::Num => value_num
                .map(Value::Num)
                .ok_or_else(|| StoreError::BadValue("num record without value_num".into())),
            ValueKind::Bool => value_num
                .map(|v| Value::Bool(v != 0.0))
                .ok_or_else(|| StoreError::BadValue("bool record without value_num".into())),
            ValueKind::Str => value_str
                .map(Value::Str)
                .ok_or_else(|| StoreError::BadValue("str record without value_str".into())),
        }
    }

    /// Best-effort parse of free text: number, then boolean, then string.
    pub fn parse_loose(raw: &str) -> Value {
        if let Ok(v) = raw.trim().parse::<f64>() {
            return Value::Num(v);
        }
        match raw.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Str(raw.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Num(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Num(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_string_into_num() {
        assert_eq!(Value::from("21.5").coerce(ValueKind::Num).unwrap(), Value::Num(21.5));
        assert!(matches!(
            Value::from("warm").coerce(ValueKind::Num),
            Err(StoreError::BadValue(_))
        ));
    }

    #[test]
    fn test_bool_columns_round_through_value_num() {
        let (num, text) = Value::Bool(true).to_columns();
        assert_eq!(num, Some(1.0));
        assert!(text.is_none());
        assert_eq!(
            Value::from_columns(ValueKind::Bool, num, text).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_missing_column_is_bad_value() {
        let result = Value::from_columns(ValueKind::Num, None, Some("x".into()));
        assert!(matches!(result, Err(StoreError::BadValue(_))));
    }

    #[test]
    fn test_truthiness() {
        assert_eq!(Value::Num(0.0).is_truthy(), Some(false));
        assert_eq!(Value::Num(-3.0).is_truthy(), Some(true));
        assert_eq!(Value::Bool(false).is_truthy(), Some(false));
        assert_eq!(Value::from("on").is_truthy(), None);
    }

    #[test]
    fn test_untagged_json_decoding() {
        let values: Vec<Value> = serde_json::from_str(r#"[true, 4.5, "text"]"#).unwrap();
        assert_eq!(
            values,
            vec![Value::Bool(true), Value::Num(4.5), Value::Str("text".into())]
        );
    }
}
