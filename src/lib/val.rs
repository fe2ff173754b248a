use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single typed cell in an input row or a computed result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Val {
    #[default]
    Null,
    Boolean(bool),
    Long(i64),
    Double(f64),
    String(String),
    Err(String),
}

impl Val {
    pub fn is_null(&self) -> bool {
        matches!(self, Val::Null)
    }

    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Val::Long(value) => Some(*value as f64),
            Val::Double(value) => Some(*value),
            Val::Boolean(value) => Some(if *value { 1.0 } else { 0.0 }),
            Val::String(value) => value.trim().parse::<f64>().ok(),
            Val::Null | Val::Err(_) => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Val::Null => 0,
            Val::Boolean(_) => 1,
            Val::Long(_) | Val::Double(_) => 2,
            Val::String(_) => 3,
            Val::Err(_) => 4,
        }
    }

    /// Total order used for sorting: nulls first, then booleans, numbers,
    /// strings and errors.
    pub fn compare(&self, other: &Val) -> Ordering {
        match (self, other) {
            (Val::Boolean(a), Val::Boolean(b)) => a.cmp(b),
            (Val::Long(a), Val::Long(b)) => a.cmp(b),
            (Val::String(a), Val::String(b)) => a.cmp(b),
            (Val::Err(a), Val::Err(b)) => a.cmp(b),
            (a, b) if a.rank() == 2 && b.rank() == 2 => {
                let lhs = a.to_f64().unwrap_or_default();
                let rhs = b.to_f64().unwrap_or_default();
                lhs.total_cmp(&rhs)
            }
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    pub fn from_json(value: &Value) -> Val {
        match value {
            Value::Null => Val::Null,
            Value::Bool(value) => Val::Boolean(*value),
            Value::Number(number) => match number.as_i64() {
                Some(value) => Val::Long(value),
                None => number.as_f64().map(Val::Double).unwrap_or(Val::Null),
            },
            Value::String(value) => Val::String(value.clone()),
            other => Val::String(other.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Val::Null => Value::Null,
            Val::Boolean(value) => Value::Bool(*value),
            Val::Long(value) => Value::from(*value),
            Val::Double(value) => serde_json::Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Val::String(value) => Value::String(value.clone()),
            Val::Err(message) => Value::String(format!("Err: {message}")),
        }
    }
}

impl PartialEq for Val {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Val::Null, Val::Null) => true,
            (Val::Boolean(a), Val::Boolean(b)) => a == b,
            (Val::Long(a), Val::Long(b)) => a == b,
            (Val::Double(a), Val::Double(b)) => a.to_bits() == b.to_bits(),
            (Val::String(a), Val::String(b)) => a == b,
            (Val::Err(a), Val::Err(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Val {}

impl Hash for Val {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Val::Null => {}
            Val::Boolean(value) => value.hash(state),
            Val::Long(value) => value.hash(state),
            Val::Double(value) => value.to_bits().hash(state),
            Val::String(value) | Val::Err(value) => value.hash(state),
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Null => Ok(()),
            Val::Boolean(value) => write!(f, "{value}"),
            Val::Long(value) => write!(f, "{value}"),
            Val::Double(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
                write!(f, "{}", *value as i64)
            }
            Val::Double(value) => write!(f, "{value}"),
            Val::String(value) => f.write_str(value),
            Val::Err(message) => write!(f, "Err: {message}"),
        }
    }
}

impl From<i64> for Val {
    fn from(value: i64) -> Self {
        Val::Long(value)
    }
}

impl From<f64> for Val {
    fn from(value: f64) -> Self {
        Val::Double(value)
    }
}

impl From<bool> for Val {
    fn from(value: bool) -> Self {
        Val::Boolean(value)
    }
}

impl From<&str> for Val {
    fn from(value: &str) -> Self {
        Val::String(value.to_string())
    }
}

impl From<String> for Val {
    fn from(value: String) -> Self {
        Val::String(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_compare_across_representations() {
        assert_eq!(Val::Long(3).compare(&Val::Double(2.5)), Ordering::Greater);
        assert_eq!(Val::Double(3.0).compare(&Val::Long(3)), Ordering::Equal);
        assert_eq!(Val::Null.compare(&Val::Long(-10)), Ordering::Less);
        assert_eq!(Val::from("a").compare(&Val::Long(99)), Ordering::Greater);
    }

    #[test]
    fn whole_doubles_display_without_fraction() {
        assert_eq!(Val::Double(3.0).to_string(), "3");
        assert_eq!(Val::Double(2.5).to_string(), "2.5");
        assert_eq!(Val::Null.to_string(), "");
    }

    #[test]
    fn json_conversion_keeps_integer_types() {
        assert_eq!(Val::from_json(&json!(7)), Val::Long(7));
        assert_eq!(Val::from_json(&json!(1.5)), Val::Double(1.5));
        assert_eq!(Val::from_json(&json!("x")), Val::from("x"));
        assert_eq!(Val::Long(7).to_json(), json!(7));
    }
}
