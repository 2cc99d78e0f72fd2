//! Key model — the totally ordered value domain of every index.
//!
//! A [`Key`] is a number, a timestamp, a string, a byte array, or an ordered
//! sequence of keys (compound indexes). Keys of different types order by
//! type rank: Number < Date < String < Bytes < Array. NaN is not a valid
//! key and is rejected at every construction site.
//!
//! [`Key::encode`] produces a canonical byte form that is both injective
//! and order-preserving (byte comparison of encodings equals [`Key`]
//! comparison). The canonical form is what OR-union deduplication and the
//! reference engine's ordered maps rely on.

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::{IdxError, IdxResult};

/// A value usable as a primary or secondary index key.
#[derive(Debug, Clone)]
pub enum Key {
    /// Finite floating number (integers included)
    Number(f64),
    /// Millisecond timestamp
    Date(i64),
    /// UTF-8 string
    String(String),
    /// Raw byte array
    Bytes(Vec<u8>),
    /// Compound key — ordered component sequence
    Array(Vec<Key>),
}

// Encoding tags. Gaps leave room for future key types without re-ordering.
const TAG_NUMBER: u8 = 0x10;
const TAG_DATE: u8 = 0x20;
const TAG_STRING: u8 = 0x30;
const TAG_BYTES: u8 = 0x40;
const TAG_ARRAY: u8 = 0x50;

impl Key {
    /// Construct a number key, rejecting NaN.
    pub fn number(v: f64) -> IdxResult<Key> {
        if v.is_nan() {
            return Err(IdxError::Data("NaN is not a valid key".to_string()));
        }
        Ok(Key::Number(v))
    }

    /// Type rank used for cross-type ordering.
    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::Date(_) => 1,
            Key::String(_) => 2,
            Key::Bytes(_) => 3,
            Key::Array(_) => 4,
        }
    }

    /// Convert a JSON value into a key.
    ///
    /// Valid inputs: finite numbers, strings, and arrays of valid inputs.
    /// Everything else (null, booleans, objects, NaN) is a `Data` error.
    pub fn from_value(value: &Value) -> IdxResult<Key> {
        match value {
            Value::Number(n) => {
                let v = n
                    .as_f64()
                    .ok_or_else(|| IdxError::Data(format!("number {n} is not a valid key")))?;
                Key::number(v)
            }
            Value::String(s) => Ok(Key::String(s.clone())),
            Value::Array(items) => {
                let mut components = Vec::with_capacity(items.len());
                for item in items {
                    components.push(Key::from_value(item)?);
                }
                Ok(Key::Array(components))
            }
            other => Err(IdxError::Data(format!("{other} is not a valid key"))),
        }
    }

    /// Convert the key back into a JSON value.
    ///
    /// Whole numbers come back as JSON integers so that a record patched
    /// with an auto-increment key reads `{"id": 1}`, not `{"id": 1.0}`.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(v) => {
                if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v <= i64::MAX as f64 {
                    Value::from(*v as i64)
                } else {
                    Value::from(*v)
                }
            }
            Key::Date(ms) => Value::from(*ms),
            Key::String(s) => Value::from(s.clone()),
            Key::Bytes(b) => Value::Array(b.iter().map(|&byte| Value::from(byte)).collect()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    /// Canonical byte encoding: injective and order-preserving.
    ///
    /// Variable-length components (strings, bytes) are terminated rather
    /// than length-prefixed so byte order matches key order; `0x00` inside
    /// a component is escaped as `0x00 0xFF`, the terminator is `0x00 0x00`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Key::Number(v) => {
                out.push(TAG_NUMBER);
                let bits = v.to_bits();
                // Flip so that the natural byte order matches numeric order.
                let ordered = if bits & (1 << 63) == 0 {
                    bits ^ (1 << 63)
                } else {
                    !bits
                };
                out.extend_from_slice(&ordered.to_be_bytes());
            }
            Key::Date(ms) => {
                out.push(TAG_DATE);
                let ordered = (*ms as u64) ^ (1 << 63);
                out.extend_from_slice(&ordered.to_be_bytes());
            }
            Key::String(s) => {
                out.push(TAG_STRING);
                encode_terminated(s.as_bytes(), out);
            }
            Key::Bytes(b) => {
                out.push(TAG_BYTES);
                encode_terminated(b, out);
            }
            Key::Array(items) => {
                out.push(TAG_ARRAY);
                for item in items {
                    item.encode_into(out);
                }
                // Component tags are all > 0x00, so a bare zero terminates.
                out.push(0x00);
            }
        }
    }

    /// String payload accessor, used by the case-insensitive planner.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::String(s) => Some(s),
            _ => None,
        }
    }
}

fn encode_terminated(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xFF);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.total_cmp(b),
            (Key::Date(a), Key::Date(b)) => a.cmp(b),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Bytes(a), Key::Bytes(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Key::Number(v as f64)
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Number(v as f64)
    }
}

impl From<u32> for Key {
    fn from(v: u32) -> Self {
        Key::Number(v as f64)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::String(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::String(v)
    }
}

/// Fallible key conversion used by the query builder surface.
///
/// Plain `From` cannot reject NaN, so every builder takes `impl IntoKey`.
pub trait IntoKey {
    fn into_key(self) -> IdxResult<Key>;
}

impl IntoKey for Key {
    fn into_key(self) -> IdxResult<Key> {
        Ok(self)
    }
}

impl IntoKey for &Key {
    fn into_key(self) -> IdxResult<Key> {
        Ok(self.clone())
    }
}

impl IntoKey for f64 {
    fn into_key(self) -> IdxResult<Key> {
        Key::number(self)
    }
}

impl IntoKey for i32 {
    fn into_key(self) -> IdxResult<Key> {
        Ok(Key::from(self))
    }
}

impl IntoKey for i64 {
    fn into_key(self) -> IdxResult<Key> {
        Ok(Key::from(self))
    }
}

impl IntoKey for u32 {
    fn into_key(self) -> IdxResult<Key> {
        Ok(Key::from(self))
    }
}

impl IntoKey for &str {
    fn into_key(self) -> IdxResult<Key> {
        Ok(Key::from(self))
    }
}

impl IntoKey for String {
    fn into_key(self) -> IdxResult<Key> {
        Ok(Key::from(self))
    }
}

impl IntoKey for Vec<Key> {
    fn into_key(self) -> IdxResult<Key> {
        Ok(Key::Array(self))
    }
}

impl<T: IntoKey, const N: usize> IntoKey for [T; N] {
    fn into_key(self) -> IdxResult<Key> {
        let mut components = Vec::with_capacity(N);
        for item in self {
            components.push(item.into_key()?);
        }
        Ok(Key::Array(components))
    }
}
