//! Values stored in a session.

use std::fmt;

/// A session value. The set of kinds is closed so reads can be checked.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

/// Discriminant of a [`SessionValue`], used in type-mismatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    UInt,
    Float,
    Text,
    Bytes,
    Json,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::UInt => "uint",
            ValueKind::Float => "float",
            ValueKind::Text => "text",
            ValueKind::Bytes => "bytes",
            ValueKind::Json => "json",
        };
        f.write_str(name)
    }
}

impl SessionValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            SessionValue::Bool(_) => ValueKind::Bool,
            SessionValue::Int(_) => ValueKind::Int,
            SessionValue::UInt(_) => ValueKind::UInt,
            SessionValue::Float(_) => ValueKind::Float,
            SessionValue::Text(_) => ValueKind::Text,
            SessionValue::Bytes(_) => ValueKind::Bytes,
            SessionValue::Json(_) => ValueKind::Json,
        }
    }
}

/// Typed extraction from a stored value.
///
/// Integer kinds convert into each other when the value fits; nothing
/// else converts.
pub trait FromSessionValue: Sized {
    const KIND: ValueKind;

    fn from_session_value(value: &SessionValue) -> Option<Self>;
}

impl FromSessionValue for bool {
    const KIND: ValueKind = ValueKind::Bool;

    fn from_session_value(value: &SessionValue) -> Option<Self> {
        match value {
            SessionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromSessionValue for i64 {
    const KIND: ValueKind = ValueKind::Int;

    fn from_session_value(value: &SessionValue) -> Option<Self> {
        match value {
            SessionValue::Int(i) => Some(*i),
            SessionValue::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }
}

impl FromSessionValue for u64 {
    const KIND: ValueKind = ValueKind::UInt;

    fn from_session_value(value: &SessionValue) -> Option<Self> {
        match value {
            SessionValue::UInt(u) => Some(*u),
            SessionValue::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }
}

impl FromSessionValue for f64 {
    const KIND: ValueKind = ValueKind::Float;

    fn from_session_value(value: &SessionValue) -> Option<Self> {
        match value {
            SessionValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl FromSessionValue for String {
    const KIND: ValueKind = ValueKind::Text;

    fn from_session_value(value: &SessionValue) -> Option<Self> {
        match value {
            SessionValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromSessionValue for Vec<u8> {
    const KIND: ValueKind = ValueKind::Bytes;

    fn from_session_value(value: &SessionValue) -> Option<Self> {
        match value {
            SessionValue::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }
}

impl FromSessionValue for serde_json::Value {
    const KIND: ValueKind = ValueKind::Json;

    fn from_session_value(value: &SessionValue) -> Option<Self> {
        match value {
            SessionValue::Json(v) => Some(v.clone()),
            _ => None,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for SessionValue {
                fn from(value: $ty) -> Self {
                    SessionValue::$variant(value.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i32 => Int,
    i64 => Int,
    u32 => UInt,
    u64 => UInt,
    f64 => Float,
    String => Text,
    &str => Text,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_pick_variant() {
        assert_eq!(SessionValue::from(3i32), SessionValue::Int(3));
        assert_eq!(SessionValue::from(3u32), SessionValue::UInt(3));
        assert_eq!(SessionValue::from("x"), SessionValue::Text("x".into()));
        assert_eq!(SessionValue::from(true).kind(), ValueKind::Bool);
    }

    #[test]
    fn test_integer_kinds_convert_when_they_fit() {
        assert_eq!(i64::from_session_value(&SessionValue::UInt(7)), Some(7));
        assert_eq!(i64::from_session_value(&SessionValue::UInt(u64::MAX)), None);
        assert_eq!(u64::from_session_value(&SessionValue::Int(-1)), None);
        assert_eq!(u64::from_session_value(&SessionValue::Int(9)), Some(9));
    }

    #[test]
    fn test_other_kinds_do_not_convert() {
        assert_eq!(String::from_session_value(&SessionValue::Int(1)), None);
        assert_eq!(f64::from_session_value(&SessionValue::Int(1)), None);
        assert_eq!(
            serde_json::Value::from_session_value(&SessionValue::Json(serde_json::json!({"a": 1}))),
            Some(serde_json::json!({"a": 1}))
        );
    }
}
