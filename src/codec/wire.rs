//! Tagged, length-prefixed binary encoding of [`Value`].
//!
//! # Format
//!
//! Every value starts with a one-byte tag. Multi-byte integers are big-endian.
//!
//! ```text
//! 0x00 Null
//! 0x01 False
//! 0x02 True
//! 0x03 Int    i64
//! 0x04 Float  f64 bits
//! 0x05 Str    u32 len | utf-8 bytes
//! 0x06 Bytes  u32 len | bytes
//! 0x07 List   u32 count | value*
//! 0x08 Map    u32 count | (u32 len | utf-8 key | value)*
//! ```
//!
//! Map keys must be unique; a duplicate key is a decode error.

use super::value::Value;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_LIST: u8 = 0x07;
const TAG_MAP: u8 = 0x08;

/// Maximum nesting depth accepted by the decoder.
pub const MAX_DEPTH: usize = 64;

/// Decode failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Input ended before the value was complete.
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    /// Unknown type tag.
    #[error("unknown tag 0x{0:02x}")]
    UnknownTag(u8),
    /// String bytes were not UTF-8.
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    /// Map repeated a key.
    #[error("duplicate map key: {0}")]
    DuplicateKey(String),
    /// Nesting exceeded [`MAX_DEPTH`].
    #[error("nesting deeper than {} levels", MAX_DEPTH)]
    TooDeep,
    /// Bytes left over after the top-level value.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
    /// A length did not fit the u32 prefix.
    #[error("length {0} exceeds u32 prefix")]
    TooLarge(usize),
}

/// Encode a value into a fresh buffer.
pub fn encode(value: &Value) -> Result<Vec<u8>, WireError> {
    let mut buf = BytesMut::with_capacity(64);
    encode_into(value, &mut buf)?;
    Ok(buf.to_vec())
}

/// Encode a value, appending to `buf`.
pub fn encode_into(value: &Value, buf: &mut BytesMut) -> Result<(), WireError> {
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Bool(false) => buf.put_u8(TAG_FALSE),
        Value::Bool(true) => buf.put_u8(TAG_TRUE),
        Value::Int(i) => {
            buf.put_u8(TAG_INT);
            buf.put_i64(*i);
        }
        Value::Float(f) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_u64(f.to_bits());
        }
        Value::Str(s) => {
            buf.put_u8(TAG_STR);
            put_len_prefixed(buf, s.as_bytes())?;
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            put_len_prefixed(buf, b)?;
        }
        Value::List(items) => {
            buf.put_u8(TAG_LIST);
            buf.put_u32(len_u32(items.len())?);
            for item in items {
                encode_into(item, buf)?;
            }
        }
        Value::Map(map) => {
            buf.put_u8(TAG_MAP);
            buf.put_u32(len_u32(map.len())?);
            for (key, item) in map {
                put_len_prefixed(buf, key.as_bytes())?;
                encode_into(item, buf)?;
            }
        }
    }
    Ok(())
}

/// Decode exactly one value spanning all of `data`.
pub fn decode(data: &[u8]) -> Result<Value, WireError> {
    let mut cursor = data;
    let value = decode_value(&mut cursor, 0)?;
    if cursor.has_remaining() {
        return Err(WireError::TrailingBytes(cursor.remaining()));
    }
    Ok(value)
}

fn decode_value(buf: &mut &[u8], depth: usize) -> Result<Value, WireError> {
    if depth > MAX_DEPTH {
        return Err(WireError::TooDeep);
    }
    need(buf, 1)?;
    let tag = buf.get_u8();
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_INT => {
            need(buf, 8)?;
            Ok(Value::Int(buf.get_i64()))
        }
        TAG_FLOAT => {
            need(buf, 8)?;
            Ok(Value::Float(f64::from_bits(buf.get_u64())))
        }
        TAG_STR => Ok(Value::Str(get_string(buf)?)),
        TAG_BYTES => Ok(Value::Bytes(get_len_prefixed(buf)?.to_vec())),
        TAG_LIST => {
            let count = get_count(buf)?;
            // Each element needs at least its tag byte.
            need(buf, count)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(buf, depth + 1)?);
            }
            Ok(Value::List(items))
        }
        TAG_MAP => {
            let count = get_count(buf)?;
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let key = get_string(buf)?;
                let item = decode_value(buf, depth + 1)?;
                if map.contains_key(&key) {
                    return Err(WireError::DuplicateKey(key));
                }
                map.insert(key, item);
            }
            Ok(Value::Map(map))
        }
        other => Err(WireError::UnknownTag(other)),
    }
}

fn need(buf: &&[u8], n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        return Err(WireError::Truncated {
            needed: n,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn get_count(buf: &mut &[u8]) -> Result<usize, WireError> {
    need(buf, 4)?;
    Ok(buf.get_u32() as usize)
}

fn get_len_prefixed<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], WireError> {
    let len = get_count(buf)?;
    need(buf, len)?;
    let whole: &'a [u8] = *buf;
    let (head, tail) = whole.split_at(len);
    *buf = tail;
    Ok(head)
}

fn get_string(buf: &mut &[u8]) -> Result<String, WireError> {
    let raw = get_len_prefixed(buf)?;
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|_| WireError::InvalidUtf8)
}

fn put_len_prefixed(buf: &mut BytesMut, data: &[u8]) -> Result<(), WireError> {
    buf.put_u32(len_u32(data.len())?);
    buf.put_slice(data);
    Ok(())
}

fn len_u32(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::TooLarge(len))
}
