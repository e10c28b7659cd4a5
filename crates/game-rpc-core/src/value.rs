//! Host-side values passed to and returned from remote procedures

use crate::error::{GameRpcError, Result};
use crate::types::{TypeDescriptor, ValueKind};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Proxy for an object owned by the server
///
/// Handles of the same class compare, hash and order purely by object id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteHandle {
    service: String,
    class: String,
    id: u64,
}

impl RemoteHandle {
    pub fn new(service: &str, class: &str, id: u64) -> Self {
        Self {
            service: service.to_string(),
            class: class.to_string(),
            id,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn tag(&self) -> (&str, &str) {
        (&self.service, &self.class)
    }
}

impl PartialEq for RemoteHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.tag() == other.tag()
    }
}

impl Eq for RemoteHandle {}

impl Hash for RemoteHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for RemoteHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RemoteHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tag()
            .cmp(&other.tag())
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{} object #{}>", self.service, self.class, self.id)
    }
}

/// A decoded or to-be-encoded value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Double(f64),
    Float(f32),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    /// Enumeration value, by its underlying integer
    Enum(i32),
    Object(RemoteHandle),
    /// Absent object handle
    Null,
    List(Vec<Value>),
    Set(Vec<Value>),
    /// Key/value pairs; encoded in ascending key order
    Dictionary(Vec<(Value, Value)>),
    Tuple(Vec<Value>),
    /// A protocol message kept in its encoded form
    Message { type_name: String, bytes: Vec<u8> },
}

impl Value {
    /// Short name of the value's host type, used in error messages
    pub fn type_name(&self) -> String {
        match self {
            Value::Double(_) => "double".into(),
            Value::Float(_) => "float".into(),
            Value::Int32(_) => "int32".into(),
            Value::Int64(_) => "int64".into(),
            Value::UInt32(_) => "uint32".into(),
            Value::UInt64(_) => "uint64".into(),
            Value::Bool(_) => "bool".into(),
            Value::String(_) => "string".into(),
            Value::Bytes(_) => "bytes".into(),
            Value::Enum(_) => "enum".into(),
            Value::Object(h) => format!("Class({}.{})", h.service(), h.class()),
            Value::Null => "null".into(),
            Value::List(_) => "list".into(),
            Value::Set(_) => "set".into(),
            Value::Dictionary(_) => "dictionary".into(),
            Value::Tuple(_) => "tuple".into(),
            Value::Message { type_name, .. } => type_name.clone(),
        }
    }

    /// Numeric values eligible for coercion. `Bool` is deliberately excluded.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Double(_)
                | Value::Float(_)
                | Value::Int32(_)
                | Value::Int64(_)
                | Value::UInt32(_)
                | Value::UInt64(_)
        )
    }

    /// Whether the value already has the host shape of `ty`
    pub fn matches(&self, ty: &TypeDescriptor) -> bool {
        match (self, ty) {
            (Value::Double(_), TypeDescriptor::Value(ValueKind::Double))
            | (Value::Float(_), TypeDescriptor::Value(ValueKind::Float))
            | (Value::Int32(_), TypeDescriptor::Value(ValueKind::Int32))
            | (Value::Int64(_), TypeDescriptor::Value(ValueKind::Int64))
            | (Value::UInt32(_), TypeDescriptor::Value(ValueKind::UInt32))
            | (Value::UInt64(_), TypeDescriptor::Value(ValueKind::UInt64))
            | (Value::Bool(_), TypeDescriptor::Value(ValueKind::Bool))
            | (Value::String(_), TypeDescriptor::Value(ValueKind::String))
            | (Value::Bytes(_), TypeDescriptor::Value(ValueKind::Bytes))
            | (Value::Enum(_), TypeDescriptor::Enumeration(_))
            | (Value::Null, TypeDescriptor::Class { .. }) => true,
            (Value::Object(h), TypeDescriptor::Class { service, class }) => {
                h.service() == service && h.class() == class
            }
            (Value::List(items), TypeDescriptor::List(elem))
            | (Value::Set(items), TypeDescriptor::Set(elem)) => {
                items.iter().all(|item| item.matches(elem))
            }
            (Value::Dictionary(entries), TypeDescriptor::Dictionary(key, value)) => entries
                .iter()
                .all(|(k, v)| k.matches(key) && v.matches(value)),
            (Value::Tuple(items), TypeDescriptor::Tuple(elems)) => {
                items.len() == elems.len()
                    && items.iter().zip(elems).all(|(item, elem)| item.matches(elem))
            }
            (Value::Message { type_name, .. }, TypeDescriptor::Message(name)) => type_name == name,
            _ => false,
        }
    }

    /// Total order used to sort dictionary keys.
    ///
    /// Values of different kinds order by kind; floats use IEEE total order.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int32(a), Value::Int32(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::UInt32(a), Value::UInt32(b)) => a.cmp(b),
            (Value::UInt64(a), Value::UInt64(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Enum(a), Value::Enum(b)) => a.cmp(b),
            (Value::Object(a), Value::Object(b)) => a.cmp(b),
            (Value::List(a), Value::List(b))
            | (Value::Set(a), Value::Set(b))
            | (Value::Tuple(a), Value::Tuple(b)) => cmp_sequences(a, b),
            (Value::Dictionary(a), Value::Dictionary(b)) => {
                for ((ak, av), (bk, bv)) in a.iter().zip(b) {
                    let ord = ak.total_cmp(bk).then_with(|| av.total_cmp(bv));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (
                Value::Message {
                    type_name: at,
                    bytes: ab,
                },
                Value::Message {
                    type_name: bt,
                    bytes: bb,
                },
            ) => at.cmp(bt).then_with(|| ab.cmp(bb)),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Double(_) => 0,
            Value::Float(_) => 1,
            Value::Int32(_) => 2,
            Value::Int64(_) => 3,
            Value::UInt32(_) => 4,
            Value::UInt64(_) => 5,
            Value::Bool(_) => 6,
            Value::String(_) => 7,
            Value::Bytes(_) => 8,
            Value::Enum(_) => 9,
            Value::Null => 10,
            Value::Object(_) => 11,
            Value::List(_) => 12,
            Value::Set(_) => 13,
            Value::Dictionary(_) => 14,
            Value::Tuple(_) => 15,
            Value::Message { .. } => 16,
        }
    }

    /// Decode a message-typed value into its protocol message
    pub fn decode_message<M: prost::Message + Default>(&self) -> Result<M> {
        match self {
            Value::Message { bytes, .. } => Ok(M::decode(bytes.as_slice())?),
            other => Err(GameRpcError::Protocol(format!(
                "Expected a message value, got a {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_handle(&self) -> Option<&RemoteHandle> {
        match self {
            Value::Object(h) => Some(h),
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
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Widen any numeric value to `f64`
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Double(v) => Some(v),
            Value::Float(v) => Some(v as f64),
            Value::Int32(v) => Some(v as f64),
            Value::Int64(v) => Some(v as f64),
            Value::UInt32(v) => Some(v as f64),
            Value::UInt64(v) => Some(v as f64),
            _ => None,
        }
    }

    /// Any integer value (or enum) as `i128`, wide enough for every wire integer
    pub fn as_integer(&self) -> Option<i128> {
        match *self {
            Value::Int32(v) | Value::Enum(v) => Some(v as i128),
            Value::Int64(v) => Some(v as i128),
            Value::UInt32(v) => Some(v as i128),
            Value::UInt64(v) => Some(v as i128),
            _ => None,
        }
    }
}

fn cmp_sequences(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = x.total_cmp(y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Double(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Int32(v) | Value::Enum(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{:?}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Object(h) => write!(f, "{}", h),
            Value::Null => f.write_str("null"),
            Value::List(items) | Value::Set(items) | Value::Tuple(items) => {
                let (open, close) = match self {
                    Value::Tuple(_) => ("(", ")"),
                    Value::Set(_) => ("{", "}"),
                    _ => ("[", "]"),
                };
                f.write_str(open)?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(close)
            }
            Value::Dictionary(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
            Value::Message { type_name, bytes } => {
                write!(f, "<{} message, {} bytes>", type_name, bytes.len())
            }
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    f64 => Double,
    f32 => Float,
    i32 => Int32,
    i64 => Int64,
    u32 => UInt32,
    u64 => UInt64,
    bool => Bool,
    String => String,
    Vec<u8> => Bytes,
    RemoteHandle => Object,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Option<RemoteHandle>> for Value {
    fn from(v: Option<RemoteHandle>) -> Self {
        v.map(Value::Object).unwrap_or(Value::Null)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}
