//! Wire codec for values and length-delimited messages
//!
//! Scalars follow protocol-buffer field encodings without the field tag:
//! little-endian IEEE-754 floats, base-128 varints for integers and
//! `varint(len) || bytes` for strings. Signed integers are sign-extended
//! to 64 bits and written as unsigned varints (no zig-zag), so `-1`
//! always takes ten bytes.

use crate::error::{GameRpcError, Result};
use crate::schema;
use crate::types::{TypeDescriptor, ValueKind};
use crate::value::{RemoteHandle, Value};
use bytes::Buf;
use prost::Message;

/// Magic sent before the RPC channel's connection request
pub const RPC_HELLO: &[u8; 12] = b"HELLO-RPC\0\0\0";
/// Magic sent before the stream channel's connection request
pub const STREAM_HELLO: &[u8; 12] = b"HELLO-STREAM";
/// Maximum size of the client name field, in bytes
pub const CLIENT_NAME_LENGTH: usize = 32;
/// Size of the client identifier assigned by the server
pub const CLIENT_IDENTIFIER_LENGTH: usize = 16;

const MAX_VARINT_LENGTH: usize = 10;

/// Base-128 varint
pub fn encode_varint(value: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_VARINT_LENGTH);
    prost::encoding::encode_varint(value, &mut buf);
    buf
}

/// Encode `value` as the wire form of `ty`
pub fn encode(value: &Value, ty: &TypeDescriptor) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(value, ty, &mut buf)?;
    Ok(buf)
}

/// Encode `value` prefixed with its byte length
pub fn encode_delimited(value: &Value, ty: &TypeDescriptor) -> Result<Vec<u8>> {
    let body = encode(value, ty)?;
    let mut buf = encode_varint(body.len() as u64);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Encode a protocol message prefixed with its byte length
pub fn encode_message_delimited<M: Message>(message: &M) -> Vec<u8> {
    message.encode_length_delimited_to_vec()
}

/// Decode the wire form of `ty`
pub fn decode(data: &[u8], ty: &TypeDescriptor) -> Result<Value> {
    match ty {
        TypeDescriptor::Value(kind) => decode_scalar(data, *kind),
        TypeDescriptor::Enumeration(name) => Ok(Value::Enum(read_int32(&mut &data[..], name)?)),
        TypeDescriptor::Class { service, class } => {
            let id = read_varint(&mut &data[..])?;
            if id == 0 {
                Ok(Value::Null)
            } else {
                Ok(Value::Object(RemoteHandle::new(service, class, id)))
            }
        }
        TypeDescriptor::Message(name) => Ok(Value::Message {
            type_name: name.clone(),
            bytes: data.to_vec(),
        }),
        TypeDescriptor::List(elem) => {
            let list = schema::List::decode(data)?;
            decode_items(&list.items, elem).map(Value::List)
        }
        TypeDescriptor::Set(elem) => {
            let set = schema::Set::decode(data)?;
            decode_items(&set.items, elem).map(Value::Set)
        }
        TypeDescriptor::Dictionary(key, value) => {
            let dict = schema::Dictionary::decode(data)?;
            dict.entries
                .iter()
                .map(|entry| Ok((decode(&entry.key, key)?, decode(&entry.value, value)?)))
                .collect::<Result<Vec<_>>>()
                .map(Value::Dictionary)
        }
        TypeDescriptor::Tuple(elems) => {
            let tuple = schema::Tuple::decode(data)?;
            if tuple.items.len() != elems.len() {
                return Err(GameRpcError::Protocol(format!(
                    "Expected a tuple of {} values, got {}",
                    elems.len(),
                    tuple.items.len()
                )));
            }
            tuple
                .items
                .iter()
                .zip(elems)
                .map(|(item, elem)| decode(item, elem))
                .collect::<Result<Vec<_>>>()
                .map(Value::Tuple)
        }
    }
}

/// Decode a value prefixed with its byte length
pub fn decode_delimited(data: &[u8], ty: &TypeDescriptor) -> Result<Value> {
    let mut buf = data;
    let size = read_varint(&mut buf)? as usize;
    if buf.len() < size {
        return Err(GameRpcError::Protocol(format!(
            "Expected {} bytes after the size prefix, got {}",
            size,
            buf.len()
        )));
    }
    decode(&buf[..size], ty)
}

/// Decode a protocol message body (no size prefix)
pub fn decode_message<M: Message + Default>(data: &[u8]) -> Result<M> {
    Ok(M::decode(data)?)
}

/// Parse a varint size prefix from the start of `data`.
///
/// Returns `Ok(None)` while the prefix is still incomplete, otherwise
/// the size and the number of prefix bytes.
pub fn decode_size(data: &[u8]) -> Result<Option<(usize, usize)>> {
    match data.iter().position(|b| b & 0x80 == 0) {
        Some(end) if end < MAX_VARINT_LENGTH => {
            let size = read_varint(&mut &data[..=end])?;
            Ok(Some((size as usize, end + 1)))
        }
        None if data.len() < MAX_VARINT_LENGTH => Ok(None),
        _ => Err(GameRpcError::Protocol(
            "Size prefix is longer than 10 bytes".to_string(),
        )),
    }
}

/// Longest prefix of `name` that fits the client name field without
/// splitting a character
pub fn truncate_client_name(name: &str) -> &str {
    if name.len() <= CLIENT_NAME_LENGTH {
        return name;
    }
    let mut end = CLIENT_NAME_LENGTH;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Client name as a fixed 32-byte field, zero padded.
///
/// For framings that carry the name in a fixed-width slot; the protobuf
/// connection request takes [`truncate_client_name`] instead.
pub fn client_name(name: &str) -> [u8; CLIENT_NAME_LENGTH] {
    let name = truncate_client_name(name).as_bytes();
    let mut field = [0u8; CLIENT_NAME_LENGTH];
    field[..name.len()].copy_from_slice(name);
    field
}

fn encode_into(value: &Value, ty: &TypeDescriptor, buf: &mut Vec<u8>) -> Result<()> {
    match ty {
        TypeDescriptor::Value(kind) => encode_scalar(value, *kind, buf),
        TypeDescriptor::Enumeration(name) => match value {
            Value::Enum(v) | Value::Int32(v) => {
                prost::encoding::encode_varint(*v as i64 as u64, buf);
                Ok(())
            }
            other => Err(mismatch(other, &format!("enumeration {}", name))),
        },
        TypeDescriptor::Class { .. } => match value {
            Value::Object(handle) => {
                prost::encoding::encode_varint(handle.id(), buf);
                Ok(())
            }
            Value::Null => {
                prost::encoding::encode_varint(0, buf);
                Ok(())
            }
            other => Err(mismatch(other, &ty.to_string())),
        },
        TypeDescriptor::Message(name) => match value {
            Value::Message { type_name, bytes } if type_name == name => {
                buf.extend_from_slice(bytes);
                Ok(())
            }
            other => Err(mismatch(other, name)),
        },
        TypeDescriptor::List(elem) => match value {
            Value::List(items) => {
                let list = schema::List {
                    items: encode_items(items, elem)?,
                };
                list.encode(buf)?;
                Ok(())
            }
            other => Err(mismatch(other, &ty.to_string())),
        },
        TypeDescriptor::Set(elem) => match value {
            Value::Set(items) => {
                let set = schema::Set {
                    items: encode_items(items, elem)?,
                };
                set.encode(buf)?;
                Ok(())
            }
            other => Err(mismatch(other, &ty.to_string())),
        },
        TypeDescriptor::Dictionary(key_type, value_type) => match value {
            Value::Dictionary(entries) => {
                let mut sorted: Vec<&(Value, Value)> = entries.iter().collect();
                sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
                let dict = schema::Dictionary {
                    entries: sorted
                        .into_iter()
                        .map(|(k, v)| {
                            Ok(schema::DictionaryEntry {
                                key: encode(k, key_type)?,
                                value: encode(v, value_type)?,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?,
                };
                dict.encode(buf)?;
                Ok(())
            }
            other => Err(mismatch(other, &ty.to_string())),
        },
        TypeDescriptor::Tuple(elems) => match value {
            Value::Tuple(items) => {
                if items.len() != elems.len() {
                    return Err(GameRpcError::Protocol(format!(
                        "Tuple of {} values does not match {}",
                        items.len(),
                        ty
                    )));
                }
                let tuple = schema::Tuple {
                    items: items
                        .iter()
                        .zip(elems)
                        .map(|(item, elem)| encode(item, elem))
                        .collect::<Result<Vec<_>>>()?,
                };
                tuple.encode(buf)?;
                Ok(())
            }
            other => Err(mismatch(other, &ty.to_string())),
        },
    }
}

fn encode_items(items: &[Value], elem: &TypeDescriptor) -> Result<Vec<Vec<u8>>> {
    items.iter().map(|item| encode(item, elem)).collect()
}

fn decode_items(items: &[Vec<u8>], elem: &TypeDescriptor) -> Result<Vec<Value>> {
    items.iter().map(|item| decode(item, elem)).collect()
}

fn encode_scalar(value: &Value, kind: ValueKind, buf: &mut Vec<u8>) -> Result<()> {
    match (kind, value) {
        (ValueKind::Double, Value::Double(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (ValueKind::Float, Value::Float(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (ValueKind::Bool, Value::Bool(v)) => prost::encoding::encode_varint(u64::from(*v), buf),
        (ValueKind::String, Value::String(s)) => write_bytes(s.as_bytes(), buf),
        (ValueKind::Bytes, Value::Bytes(b)) => write_bytes(b, buf),
        (ValueKind::Int32 | ValueKind::Int64 | ValueKind::UInt32 | ValueKind::UInt64, v) => {
            let i = plain_integer(v).ok_or_else(|| mismatch(v, kind.name()))?;
            let fits = match kind {
                ValueKind::Int32 => i32::try_from(i).is_ok(),
                ValueKind::Int64 => i64::try_from(i).is_ok(),
                _ if i < 0 => {
                    return Err(GameRpcError::Protocol(format!(
                        "Negative value {} cannot be encoded as {}",
                        i,
                        kind.name()
                    )));
                }
                ValueKind::UInt32 => u32::try_from(i).is_ok(),
                _ => u64::try_from(i).is_ok(),
            };
            if !fits {
                return Err(GameRpcError::Encoding(format!(
                    "{} is out of range for {}",
                    i,
                    kind.name()
                )));
            }
            prost::encoding::encode_varint(i as i64 as u64, buf);
        }
        (_, other) => return Err(mismatch(other, kind.name())),
    }
    Ok(())
}

fn decode_scalar(data: &[u8], kind: ValueKind) -> Result<Value> {
    let mut buf = data;
    let value = match kind {
        ValueKind::Double => {
            need(buf, 8)?;
            Value::Double(buf.get_f64_le())
        }
        ValueKind::Float => {
            need(buf, 4)?;
            Value::Float(buf.get_f32_le())
        }
        ValueKind::Int32 => Value::Int32(read_int32(&mut buf, kind.name())?),
        ValueKind::Int64 => Value::Int64(read_varint(&mut buf)? as i64),
        ValueKind::UInt32 => {
            let v = read_varint(&mut buf)?;
            Value::UInt32(u32::try_from(v).map_err(|_| out_of_range(v as i128, kind.name()))?)
        }
        ValueKind::UInt64 => Value::UInt64(read_varint(&mut buf)?),
        ValueKind::Bool => Value::Bool(read_varint(&mut buf)? != 0),
        ValueKind::String => {
            let bytes = read_bytes(&mut buf)?;
            Value::String(String::from_utf8(bytes.to_vec()).map_err(|e| {
                GameRpcError::Protocol(format!("String is not valid UTF-8: {}", e))
            })?)
        }
        ValueKind::Bytes => Value::Bytes(read_bytes(&mut buf)?.to_vec()),
    };
    Ok(value)
}

/// Signed 32-bit values arrive sign-extended to 64 bits
fn read_int32(buf: &mut &[u8], what: &str) -> Result<i32> {
    let v = read_varint(buf)? as i64;
    i32::try_from(v).map_err(|_| out_of_range(v as i128, what))
}

fn out_of_range(value: i128, what: &str) -> GameRpcError {
    GameRpcError::Protocol(format!("Decoded value {} does not fit {}", value, what))
}

/// Integer values only; enumerations are not accepted as plain integers
fn plain_integer(value: &Value) -> Option<i128> {
    match value {
        Value::Enum(_) => None,
        other => other.as_integer(),
    }
}

fn write_bytes(data: &[u8], buf: &mut Vec<u8>) {
    prost::encoding::encode_varint(data.len() as u64, buf);
    buf.extend_from_slice(data);
}

fn read_varint(buf: &mut &[u8]) -> Result<u64> {
    Ok(prost::encoding::decode_varint(buf)?)
}

fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = read_varint(buf)? as usize;
    need(buf, len)?;
    let slice: &'a [u8] = buf;
    let head = &slice[..len];
    buf.advance(len);
    Ok(head)
}

fn need(buf: &[u8], len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(GameRpcError::Protocol(format!(
            "Expected {} bytes, got {}",
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

fn mismatch(value: &Value, expected: &str) -> GameRpcError {
    GameRpcError::Encoding(format!(
        "Cannot encode a {} as {}",
        value.type_name(),
        expected
    ))
}
