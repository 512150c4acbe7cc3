//! Generic tag-tree decoding of protobuf wire data.
//!
//! Game payloads arrive without a schema, so every length-delimited field is
//! first tried as a nested message and kept as raw bytes when that fails.
//! Repeated field ids collapse into a [`Value::List`] in wire order.

use crate::error::TreeError;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

// Nested payloads below this depth are kept as bytes
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(u64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Message(BTreeMap<u32, Value>),
}

impl Value {
    /// Field `id` of a message. Lists and scalars have no fields.
    pub fn field(&self, id: u32) -> Option<&Value> {
        match self {
            Value::Message(fields) => fields.get(&id),
            _ => None,
        }
    }

    /// Walks nested messages, e.g. `path(&[1, 5])` for field 5 of field 1.
    pub fn path(&self, ids: &[u32]) -> Option<&Value> {
        ids.iter().try_fold(self, |node, id| node.field(*id))
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Zero and empty values count as absent.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Int(v) => *v != 0,
            Value::Bytes(b) => !b.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Message(_) => true,
        }
    }

    /// Iterates a field that may hold one node or a list of nodes.
    pub fn items(&self) -> std::slice::Iter<'_, Value> {
        match self {
            Value::List(items) => items.iter(),
            single => std::slice::from_ref(single).iter(),
        }
    }
}

/// Decodes `data` as one message. Malformed input is an error, never a panic.
pub fn decode(data: &[u8]) -> Result<Value, TreeError> {
    decode_message(data, 0).map(Value::Message)
}

fn decode_message(data: &[u8], depth: usize) -> Result<BTreeMap<u32, Value>, TreeError> {
    let mut fields = BTreeMap::new();
    let mut i = 0;

    while i < data.len() {
        let key_offset = i;
        let (key, read) = read_varint(&data[i..]).ok_or(TreeError::TruncatedVarint(i))?;
        i += read;

        let field_num = key >> 3;
        let field = match u32::try_from(field_num) {
            Ok(f) if f > 0 => f,
            _ => {
                return Err(TreeError::FieldNumber {
                    field: field_num,
                    offset: key_offset,
                })
            }
        };

        let value = match (key & 0x07) as u8 {
            WIRE_VARINT => {
                let (v, read) = read_varint(&data[i..]).ok_or(TreeError::TruncatedVarint(i))?;
                i += read;
                Value::Int(v)
            }
            WIRE_FIXED64 => {
                let bytes = take(data, i, 8)?;
                i += 8;
                Value::Int(LittleEndian::read_u64(bytes))
            }
            WIRE_LEN => {
                let (len, read) = read_varint(&data[i..]).ok_or(TreeError::TruncatedVarint(i))?;
                i += read;
                let len = usize::try_from(len).map_err(|_| TreeError::Overrun {
                    offset: i,
                    needed: usize::MAX,
                    available: data.len() - i,
                })?;
                let bytes = take(data, i, len)?;
                i += len;
                decode_nested(bytes, depth)
            }
            WIRE_FIXED32 => {
                let bytes = take(data, i, 4)?;
                i += 4;
                Value::Int(u64::from(LittleEndian::read_u32(bytes)))
            }
            wire_type => {
                return Err(TreeError::WireType {
                    wire_type,
                    offset: key_offset,
                })
            }
        };

        push_field(&mut fields, field, value);
    }

    Ok(fields)
}

fn decode_nested(bytes: &[u8], depth: usize) -> Value {
    if bytes.is_empty() || depth + 1 >= MAX_DEPTH {
        return Value::Bytes(bytes.to_vec());
    }
    match decode_message(bytes, depth + 1) {
        Ok(fields) if !fields.is_empty() => Value::Message(fields),
        _ => Value::Bytes(bytes.to_vec()),
    }
}

fn push_field(fields: &mut BTreeMap<u32, Value>, field: u32, value: Value) {
    match fields.entry(field) {
        Entry::Vacant(slot) => {
            slot.insert(value);
        }
        Entry::Occupied(mut slot) => match slot.get_mut() {
            Value::List(items) => items.push(value),
            existing => {
                let first = std::mem::replace(existing, Value::List(Vec::with_capacity(2)));
                *existing = Value::List(vec![first, value]);
            }
        },
    }
}

fn take(data: &[u8], offset: usize, len: usize) -> Result<&[u8], TreeError> {
    data.get(offset..)
        .and_then(|rest| rest.get(..len))
        .ok_or(TreeError::Overrun {
            offset,
            needed: len,
            available: data.len().saturating_sub(offset),
        })
}

/// Returns `None` if the buffer ends before the varint is finished
/// or the varint runs past 64 bits.
pub(crate) fn read_varint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0;

    for (pos, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Some((value, pos + 1));
        }
        shift += 7;
    }
    None
}

/// Encodes a message tree back to wire format. Integers are written as
/// varints and lists as repeated fields.
#[cfg(test)]
pub(crate) fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    if let Value::Message(fields) = value {
        for (field, v) in fields {
            encode_field(&mut out, *field, v);
        }
    }
    out
}

#[cfg(test)]
fn encode_field(out: &mut Vec<u8>, field: u32, value: &Value) {
    match value {
        Value::Int(v) => {
            write_varint(out, (u64::from(field) << 3) | u64::from(WIRE_VARINT));
            write_varint(out, *v);
        }
        Value::Bytes(bytes) => {
            write_varint(out, (u64::from(field) << 3) | u64::from(WIRE_LEN));
            write_varint(out, bytes.len() as u64);
            out.extend_from_slice(bytes);
        }
        Value::Message(_) => {
            let body = encode(value);
            write_varint(out, (u64::from(field) << 3) | u64::from(WIRE_LEN));
            write_varint(out, body.len() as u64);
            out.extend_from_slice(&body);
        }
        Value::List(items) => {
            for item in items {
                encode_field(out, field, item);
            }
        }
    }
}

#[cfg(test)]
fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}
