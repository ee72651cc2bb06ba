//! Typed scalar container, ported from `src/private_include/value.h`.
//!
//! A [`Value`] is the payload of a KEYVAL (in a config) or a DEFAULT (in a
//! mold). It is a small tagged union rather than a trait object: the set of
//! value kinds is closed and fixed by the schema (string/int/float/bool/enum),
//! so an enum with associated data is the idiomatic and cheapest
//! representation — no need for `Box<dyn Any>` indirection here.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The type tag of a [`Value`]. Mirrors `enum disir_value_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    String,
    Integer,
    Float,
    Boolean,
    Enum,
    Unknown,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::String => "STRING",
            ValueType::Integer => "INTEGER",
            ValueType::Float => "FLOAT",
            ValueType::Boolean => "BOOLEAN",
            ValueType::Enum => "ENUM",
            ValueType::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A typed scalar. `Enum` carries its string value; the legal-member
/// restriction list lives on the owning KEYVAL/SECTION, not in the value
/// itself (spec.md §3: "ENUM is string-valued with an associated restriction
/// list").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Enum(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Enum(_) => ValueType::Enum,
        }
    }

    /// The trivial zero value for a given type. Passing an empty/absent
    /// string for `String` empties the value, per `dx_value_set_string`.
    pub fn zero(value_type: ValueType) -> Result<Value, Error> {
        match value_type {
            ValueType::String => Ok(Value::String(String::new())),
            ValueType::Integer => Ok(Value::Integer(0)),
            ValueType::Float => Ok(Value::Float(0.0)),
            ValueType::Boolean => Ok(Value::Boolean(false)),
            ValueType::Enum => Ok(Value::Enum(String::new())),
            ValueType::Unknown => Err(Error::WrongValueType(
                "cannot construct a zero value of type UNKNOWN".into(),
            )),
        }
    }

    /// Canonical stringification: `"True"`/`"False"` for booleans, six-digit
    /// float formatting, plain decimal integers, strings as-is.
    pub fn stringify(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Enum(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => format!("{:.6}", f),
            Value::Boolean(b) => if *b { "True" } else { "False" }.to_string(),
        }
    }

    /// Signed comparator: `i32::MIN` when types differ, else the natural
    /// ordering of the underlying scalar (0 if equal).
    pub fn compare(&self, other: &Value) -> i32 {
        if self.value_type() != other.value_type() {
            return i32::MIN;
        }
        let ordering = match (self, other) {
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Enum(a), Value::Enum(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            _ => unreachable!("value_type guard above guarantees matching variants"),
        };
        match ordering {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    /// Deep copy guarded by type equality, mirroring `dx_value_copy`.
    pub fn copy_from(&mut self, source: &Value) -> Result<(), Error> {
        if self.value_type() != source.value_type() {
            return Err(Error::InvalidArgument(format!(
                "cannot copy {} into {}",
                source.value_type(),
                self.value_type()
            )));
        }
        *self = source.clone();
        Ok(())
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Enum(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stringify())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stringify_matches_source_format() {
        assert_eq!(Value::Boolean(true).stringify(), "True");
        assert_eq!(Value::Boolean(false).stringify(), "False");
        assert_eq!(Value::Integer(42).stringify(), "42");
        assert_eq!(Value::Float(3.5).stringify(), "3.500000");
        assert_eq!(Value::String("hi".into()).stringify(), "hi");
    }

    #[test]
    fn compare_cross_type_is_int_min() {
        assert_eq!(Value::Integer(1).compare(&Value::String("1".into())), i32::MIN);
    }

    #[test]
    fn compare_same_type() {
        assert_eq!(Value::Integer(1).compare(&Value::Integer(2)), -1);
        assert_eq!(Value::Integer(2).compare(&Value::Integer(1)), 1);
        assert_eq!(Value::Integer(2).compare(&Value::Integer(2)), 0);
    }

    #[test]
    fn copy_from_rejects_type_mismatch() {
        let mut v = Value::Integer(0);
        assert!(v.copy_from(&Value::String("x".into())).is_err());
        assert!(v.copy_from(&Value::Integer(9)).is_ok());
        assert_eq!(v, Value::Integer(9));
    }

    #[test]
    fn zero_values() {
        assert_eq!(Value::zero(ValueType::String).unwrap(), Value::String(String::new()));
        assert_eq!(Value::zero(ValueType::Boolean).unwrap(), Value::Boolean(false));
        assert!(Value::zero(ValueType::Unknown).is_err());
    }
}
