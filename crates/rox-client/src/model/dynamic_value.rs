use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Tagged union over the value kinds the expression language and the
/// custom-property layer can carry.
///
/// `Null` and `Undefined` are distinct: `Null` is an explicit empty value,
/// `Undefined` marks an unknown that propagates through comparisons.
#[derive(Debug, Clone, PartialEq)]
pub enum DynamicValue {
    Int(i64),
    Double(f64),
    Bool(bool),
    String(String),
    DateTime(DateTime<Utc>),
    List(Vec<DynamicValue>),
    Map(HashMap<String, DynamicValue>),
    Null,
    Undefined,
}

impl DynamicValue {
    pub fn is_int(&self) -> bool {
        matches!(self, DynamicValue::Int(_))
    }

    pub fn is_double(&self) -> bool {
        matches!(self, DynamicValue::Double(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, DynamicValue::Int(_) | DynamicValue::Double(_))
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, DynamicValue::Bool(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, DynamicValue::String(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, DynamicValue::List(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DynamicValue::Null)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, DynamicValue::Undefined)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            DynamicValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            DynamicValue::Double(value) => Some(*value),
            _ => None,
        }
    }

    /// Numeric view with int promoted to double.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            DynamicValue::Int(value) => Some(*value as f64),
            DynamicValue::Double(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DynamicValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[DynamicValue]> {
        match self {
            DynamicValue::List(values) => Some(values),
            _ => None,
        }
    }

    /// Structural deep equality with int/double numeric equivalence.
    ///
    /// The string-vs-number distinction is preserved (`"123"` never equals
    /// `123`), and `Undefined` equals `Undefined`.
    pub fn deep_eq(&self, other: &DynamicValue) -> bool {
        match (self, other) {
            (DynamicValue::Int(_) | DynamicValue::Double(_), DynamicValue::Int(_) | DynamicValue::Double(_)) => {
                self.as_number() == other.as_number()
            }
            (DynamicValue::Bool(a), DynamicValue::Bool(b)) => a == b,
            (DynamicValue::String(a), DynamicValue::String(b)) => a == b,
            (DynamicValue::DateTime(a), DynamicValue::DateTime(b)) => a == b,
            (DynamicValue::List(a), DynamicValue::List(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.deep_eq(y))
            }
            (DynamicValue::Map(a), DynamicValue::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(key, value)| b.get(key).map(|v| value.deep_eq(v)).unwrap_or(false))
            }
            (DynamicValue::Null, DynamicValue::Null) => true,
            (DynamicValue::Undefined, DynamicValue::Undefined) => true,
            _ => false,
        }
    }

    /// Canonical textual form used by the operator library and the flag
    /// converters. `None` for values without one (null, undefined, list, map).
    pub fn to_canonical_string(&self) -> Option<String> {
        match self {
            DynamicValue::Int(value) => Some(value.to_string()),
            DynamicValue::Double(value) => Some(double_to_string(*value)),
            DynamicValue::Bool(value) => Some(value.to_string()),
            DynamicValue::String(value) => Some(value.clone()),
            DynamicValue::DateTime(value) => Some(value.to_rfc3339()),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for DynamicValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => DynamicValue::Null,
            serde_json::Value::Bool(b) => DynamicValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DynamicValue::Int(i)
                } else {
                    DynamicValue::Double(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => DynamicValue::String(s),
            serde_json::Value::Array(items) => {
                DynamicValue::List(items.into_iter().map(DynamicValue::from).collect())
            }
            serde_json::Value::Object(entries) => DynamicValue::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, DynamicValue::from(value)))
                    .collect(),
            ),
        }
    }
}

/// Integral doubles render without a trailing fraction so that flag values
/// round-trip through their string form.
pub(crate) fn double_to_string(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equivalence() {
        assert!(DynamicValue::Int(123).deep_eq(&DynamicValue::Double(123.0)));
        assert!(DynamicValue::Double(1.5).deep_eq(&DynamicValue::Double(1.5)));
        assert!(!DynamicValue::Int(123).deep_eq(&DynamicValue::String("123".into())));
    }

    #[test]
    fn test_undefined_and_null_are_distinct() {
        assert!(DynamicValue::Undefined.deep_eq(&DynamicValue::Undefined));
        assert!(DynamicValue::Null.deep_eq(&DynamicValue::Null));
        assert!(!DynamicValue::Null.deep_eq(&DynamicValue::Undefined));
    }

    #[test]
    fn test_deep_equality_is_structural() {
        let a = DynamicValue::List(vec![
            DynamicValue::Int(1),
            DynamicValue::String("x".into()),
            DynamicValue::List(vec![DynamicValue::Bool(true)]),
        ]);
        let b = DynamicValue::List(vec![
            DynamicValue::Double(1.0),
            DynamicValue::String("x".into()),
            DynamicValue::List(vec![DynamicValue::Bool(true)]),
        ]);
        assert!(a.deep_eq(&b));
    }

    #[test]
    fn test_canonical_strings() {
        assert_eq!(DynamicValue::Int(5).to_canonical_string().unwrap(), "5");
        assert_eq!(DynamicValue::Double(2.5).to_canonical_string().unwrap(), "2.5");
        assert_eq!(DynamicValue::Double(2.0).to_canonical_string().unwrap(), "2");
        assert_eq!(DynamicValue::Bool(true).to_canonical_string().unwrap(), "true");
        assert!(DynamicValue::Undefined.to_canonical_string().is_none());
    }
}
