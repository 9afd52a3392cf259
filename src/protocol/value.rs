use std::fmt::{Display, Formatter};
use crate::protocol::enums::EnumMember;

/// A field value, either in its wire-adjacent ("untransformed") shape or in its ergonomic
///  ("transformed") shape. Which variants are meaningful depends on the field's type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<String>),
    Enum(EnumMember),
    Bitmask(Vec<EnumMember>),
    Array(Vec<Value>),
    Struct(Vec<(String, Value)>),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Uint(_) => "uint",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Enum(_) => "enum",
            Value::Bitmask(_) => "bitmask",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::Bool(b) => Some(*b as u64),
            Value::Enum(m) => Some(m.value()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Uint(v) => i64::try_from(*v).ok(),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Uint(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Uint(0) | Value::Int(0) => Some(false),
            Value::Uint(1) | Value::Int(1) => Some(true),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Looks up a named entry in a `Struct` value
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(entries) => entries.iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Uint(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bytes(v) => {
                for b in v {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            Value::Str(v) => write!(f, "{:?}", v),
            Value::List(v) => write!(f, "{}", v.join(",")),
            Value::Enum(m) => write!(f, "{}", m),
            Value::Bitmask(members) => {
                write!(f, "{{")?;
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", m)?;
                }
                write!(f, "}}")
            }
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Struct(entries) => {
                write!(f, "{{")?;
                for (i, (n, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", n, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

macro_rules! from_impl {
    ($ty:ty, $variant:ident, $conv:ty) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Value {
                Value::$variant(v as $conv)
            }
        }
    }
}

from_impl!(u8, Uint, u64);
from_impl!(u16, Uint, u64);
from_impl!(u32, Uint, u64);
from_impl!(u64, Uint, u64);
from_impl!(i8, Int, i64);
from_impl!(i16, Int, i64);
from_impl!(i32, Int, i64);
from_impl!(i64, Int, i64);
from_impl!(f32, Float, f64);
from_impl!(f64, Float, f64);

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(v)
    }
}
impl From<EnumMember> for Value {
    fn from(v: EnumMember) -> Value {
        Value::Enum(v)
    }
}
