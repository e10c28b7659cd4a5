//! Type system: protocol type strings to interned type descriptors
//!
//! Descriptor strings look like `int32`, `KRPC.Services`,
//! `SpaceCenter.SASMode`, `Class(SpaceCenter.Vessel)`, `List(T)`,
//! `Set(T)`, `Dictionary(K,V)` and `Tuple(T1,T2,...)`.

use crate::attributes;
use crate::error::{GameRpcError, Result};
use crate::schema::MESSAGE_TYPES;
use crate::value::Value;
use regex::Regex;
use serde::{Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

static CLASS_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Class\(([^\.\(\),]+)\.([^\.\(\),]+)\)$").expect("valid regex"));
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+\.[A-Za-z0-9_]+$").expect("valid regex"));

/// Wire primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Double,
    Float,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Bool,
    String,
    Bytes,
}

impl ValueKind {
    pub const ALL: [ValueKind; 9] = [
        ValueKind::Double,
        ValueKind::Float,
        ValueKind::Int32,
        ValueKind::Int64,
        ValueKind::UInt32,
        ValueKind::UInt64,
        ValueKind::Bool,
        ValueKind::String,
        ValueKind::Bytes,
    ];

    /// Protocol type string
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Double => "double",
            ValueKind::Float => "float",
            ValueKind::Int32 => "int32",
            ValueKind::Int64 => "int64",
            ValueKind::UInt32 => "uint32",
            ValueKind::UInt64 => "uint64",
            ValueKind::Bool => "bool",
            ValueKind::String => "string",
            ValueKind::Bytes => "bytes",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, ValueKind::Bool | ValueKind::String | ValueKind::Bytes)
    }
}

/// Shared handle to an interned descriptor
pub type TypeRef = Arc<TypeDescriptor>;

/// Runtime description of a protocol type
#[derive(Debug, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Value(ValueKind),
    /// Structured protocol message, kept encoded on the host side
    Message(String),
    /// Wire representation is a signed 32-bit integer
    Enumeration(String),
    /// Wire representation is an unsigned 64-bit object id
    Class { service: String, class: String },
    List(TypeRef),
    Set(TypeRef),
    Dictionary(TypeRef, TypeRef),
    Tuple(Vec<TypeRef>),
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Value(kind) => f.write_str(kind.name()),
            TypeDescriptor::Message(name) | TypeDescriptor::Enumeration(name) => f.write_str(name),
            TypeDescriptor::Class { service, class } => write!(f, "Class({}.{})", service, class),
            TypeDescriptor::List(t) => write!(f, "List({})", t),
            TypeDescriptor::Set(t) => write!(f, "Set({})", t),
            TypeDescriptor::Dictionary(k, v) => write!(f, "Dictionary({},{})", k, v),
            TypeDescriptor::Tuple(types) => {
                f.write_str("Tuple(")?;
                for (i, t) in types.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", t)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl Serialize for TypeDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A value could not be coerced to a type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to coerce value of type {actual} to type {expected}")]
pub struct CoercionError {
    pub expected: String,
    pub actual: String,
}

/// Interning store of type descriptors
///
/// Resolving the same descriptor string twice yields the same
/// [`TypeRef`] instance for the lifetime of the store.
pub struct TypeStore {
    types: Mutex<HashMap<String, TypeRef>>,
    message_types: Mutex<HashSet<String>>,
}

impl Default for TypeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeStore {
    /// Create a store that knows the built-in protocol message types
    pub fn new() -> Self {
        Self {
            types: Mutex::new(HashMap::new()),
            message_types: Mutex::new(MESSAGE_TYPES.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// Make `name` resolve to a message type rather than an enumeration
    pub fn register_message_type(&self, name: &str) {
        lock(&self.message_types).insert(name.to_string());
    }

    /// Resolve a descriptor string, interning the result
    pub fn as_type(&self, type_string: &str) -> Result<TypeRef> {
        if let Some(existing) = lock(&self.types).get(type_string) {
            return Ok(existing.clone());
        }
        // Parsing recurses into as_type for nested types, so the map is
        // not held while parsing. A concurrent resolution of the same
        // string keeps whichever instance was inserted first.
        let parsed = Arc::new(self.parse(type_string)?);
        Ok(lock(&self.types)
            .entry(type_string.to_string())
            .or_insert(parsed)
            .clone())
    }

    /// Descriptor for a wire primitive
    pub fn value_type(&self, kind: ValueKind) -> TypeRef {
        match self.as_type(kind.name()) {
            Ok(t) => t,
            Err(_) => Arc::new(TypeDescriptor::Value(kind)),
        }
    }

    /// Type of parameter `position`, refined by `ParameterType(n)` attributes
    pub fn get_parameter_type<S: AsRef<str>>(
        &self,
        position: usize,
        type_string: &str,
        attributes: &[S],
    ) -> Result<TypeRef> {
        for attr in attributes::parameter_type_attrs(position, attributes) {
            if let Ok(t) = self.as_type(attr) {
                return Ok(t);
            }
        }
        self.as_type(type_string)
    }

    /// Return type, refined by `ReturnType` attributes
    pub fn get_return_type<S: AsRef<str>>(
        &self,
        type_string: &str,
        attributes: &[S],
    ) -> Result<TypeRef> {
        for attr in attributes::return_type_attrs(attributes) {
            if let Ok(t) = self.as_type(attr) {
                return Ok(t);
            }
        }
        self.as_type(type_string)
    }

    /// Convert `value` to the host shape of `ty`.
    ///
    /// Only numeric conversions are attempted (`bool` is not numeric),
    /// plus `Null` for class types and list/tuple reshaping with
    /// element-wise coercion.
    pub fn coerce_to(
        &self,
        value: &Value,
        ty: &TypeDescriptor,
    ) -> std::result::Result<Value, CoercionError> {
        let fail = || CoercionError {
            expected: ty.to_string(),
            actual: value.type_name(),
        };

        match (value, ty) {
            (Value::Null, TypeDescriptor::Class { .. }) => Ok(Value::Null),
            (Value::List(items) | Value::Tuple(items), TypeDescriptor::List(elem)) => items
                .iter()
                .map(|item| self.coerce_element(item, elem))
                .collect::<std::result::Result<_, _>>()
                .map(Value::List)
                .map_err(|_| fail()),
            (Value::List(items) | Value::Tuple(items), TypeDescriptor::Tuple(elems)) => {
                if items.len() != elems.len() {
                    return Err(fail());
                }
                items
                    .iter()
                    .zip(elems)
                    .map(|(item, elem)| self.coerce_element(item, elem))
                    .collect::<std::result::Result<_, _>>()
                    .map(Value::Tuple)
                    .map_err(|_| fail())
            }
            (v, TypeDescriptor::Value(kind)) if v.is_numeric() && kind.is_numeric() => {
                coerce_numeric(v, *kind).ok_or_else(fail)
            }
            _ => Err(fail()),
        }
    }

    fn coerce_element(
        &self,
        item: &Value,
        ty: &TypeDescriptor,
    ) -> std::result::Result<Value, CoercionError> {
        if item.matches(ty) {
            Ok(item.clone())
        } else {
            self.coerce_to(item, ty)
        }
    }

    fn parse(&self, type_string: &str) -> Result<TypeDescriptor> {
        if let Some(kind) = ValueKind::from_name(type_string) {
            return Ok(TypeDescriptor::Value(kind));
        }
        if type_string.starts_with("Class(") {
            let c = CLASS_TYPE
                .captures(type_string)
                .ok_or_else(|| invalid(type_string, "class type"))?;
            return Ok(TypeDescriptor::Class {
                service: c[1].to_string(),
                class: c[2].to_string(),
            });
        }
        if let Some(inner) = generic_args(type_string, "List") {
            let args = split_type_args(inner).ok_or_else(|| invalid(type_string, "list type"))?;
            let [elem] = args.as_slice() else {
                return Err(invalid(type_string, "list type"));
            };
            return Ok(TypeDescriptor::List(self.as_type(elem)?));
        }
        if let Some(inner) = generic_args(type_string, "Set") {
            let args = split_type_args(inner).ok_or_else(|| invalid(type_string, "set type"))?;
            let [elem] = args.as_slice() else {
                return Err(invalid(type_string, "set type"));
            };
            return Ok(TypeDescriptor::Set(self.as_type(elem)?));
        }
        if let Some(inner) = generic_args(type_string, "Dictionary") {
            let args =
                split_type_args(inner).ok_or_else(|| invalid(type_string, "dictionary type"))?;
            let [key, value] = args.as_slice() else {
                return Err(invalid(type_string, "dictionary type"));
            };
            return Ok(TypeDescriptor::Dictionary(
                self.as_type(key)?,
                self.as_type(value)?,
            ));
        }
        if let Some(inner) = generic_args(type_string, "Tuple") {
            let args = split_type_args(inner).ok_or_else(|| invalid(type_string, "tuple type"))?;
            let types = args
                .iter()
                .map(|arg| self.as_type(arg))
                .collect::<Result<Vec<_>>>()?;
            return Ok(TypeDescriptor::Tuple(types));
        }
        if IDENTIFIER.is_match(type_string) {
            if lock(&self.message_types).contains(type_string) {
                return Ok(TypeDescriptor::Message(type_string.to_string()));
            }
            return Ok(TypeDescriptor::Enumeration(type_string.to_string()));
        }
        Err(GameRpcError::Protocol(format!(
            "'{}' is not a valid type string",
            type_string
        )))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn invalid(type_string: &str, what: &str) -> GameRpcError {
    GameRpcError::Protocol(format!(
        "'{}' is not a valid type string for a {}",
        type_string, what
    ))
}

/// `Name(args)` -> `args`
fn generic_args<'a>(type_string: &'a str, name: &str) -> Option<&'a str> {
    type_string
        .strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

/// Split a comma separated list of type strings at nesting depth zero.
/// Returns `None` for unbalanced parentheses or empty elements.
fn split_type_args(args: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, ch) in args.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1)?,
            ',' if depth == 0 => {
                parts.push(&args[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return None;
    }
    parts.push(&args[start..]);
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(parts)
}

/// Range-checked numeric conversion; floats truncate toward zero
fn coerce_numeric(value: &Value, kind: ValueKind) -> Option<Value> {
    if let Some(f) = match *value {
        Value::Double(v) => Some(v),
        Value::Float(v) => Some(v as f64),
        _ => None,
    } {
        return match kind {
            ValueKind::Double => Some(Value::Double(f)),
            ValueKind::Float => Some(Value::Float(f as f32)),
            _ if !f.is_finite() => None,
            _ => integer_to(f.trunc() as i128, f.trunc(), kind),
        };
    }

    let i = value.as_integer()?;
    match kind {
        ValueKind::Double => Some(Value::Double(i as f64)),
        ValueKind::Float => Some(Value::Float(i as f32)),
        _ => integer_to(i, i as f64, kind),
    }
}

fn integer_to(i: i128, approx: f64, kind: ValueKind) -> Option<Value> {
    // `as i128` saturates, so compare the float too for huge magnitudes
    let fits = |min: f64, max: f64| approx >= min && approx <= max;
    match kind {
        ValueKind::Int32 if fits(i32::MIN as f64, i32::MAX as f64) => {
            i32::try_from(i).ok().map(Value::Int32)
        }
        ValueKind::Int64 if fits(i64::MIN as f64, i64::MAX as f64) => {
            i64::try_from(i).ok().map(Value::Int64)
        }
        ValueKind::UInt32 if fits(0.0, u32::MAX as f64) => u32::try_from(i).ok().map(Value::UInt32),
        ValueKind::UInt64 if fits(0.0, u64::MAX as f64) => u64::try_from(i).ok().map(Value::UInt64),
        _ => None,
    }
}
