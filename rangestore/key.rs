use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use std::cmp::Ordering;

/// Keys longer than this are never routed.
pub const MAX_KEY_LEN: usize = 1 << 30;

/// Type of the keys stored in an index. Fixed width key types are
/// encoded little endian.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Int,
    LongInt,
    Float,
    Double,
    String,
    Bytes,
}

impl KeyType {
    /// Whether statistics for the key type are kept as floating point values.
    pub fn is_float(self) -> bool {
        !matches!(self, KeyType::Int | KeyType::LongInt)
    }

    fn width(self) -> Option<usize> {
        match self {
            KeyType::Int | KeyType::Float => Some(4),
            KeyType::LongInt | KeyType::Double => Some(8),
            KeyType::String | KeyType::Bytes => None,
        }
    }

    /// Checks the key is non-empty, within `MAX_KEY_LEN` and has the width
    /// of fixed size key types.
    pub fn validate(self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Routing("empty key".to_string()));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(Error::Routing(format!(
                "key of {} bytes exceeds the maximum key length",
                key.len()
            )));
        }
        match self.width() {
            Some(w) if w != key.len() => Err(Error::Routing(format!(
                "{:?} keys are {} bytes, got {}",
                self,
                w,
                key.len()
            ))),
            _ => Ok(()),
        }
    }

    /// Orders two keys of this type. Numeric types compare by value, strings
    /// and byte keys lexicographically with the shorter key first on a tie.
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match (self, a.len(), b.len()) {
            (KeyType::Int, 4, 4) => LittleEndian::read_i32(a).cmp(&LittleEndian::read_i32(b)),
            (KeyType::LongInt, 8, 8) => {
                LittleEndian::read_i64(a).cmp(&LittleEndian::read_i64(b))
            }
            (KeyType::Float, 4, 4) => {
                LittleEndian::read_f32(a).total_cmp(&LittleEndian::read_f32(b))
            }
            (KeyType::Double, 8, 8) => {
                LittleEndian::read_f64(a).total_cmp(&LittleEndian::read_f64(b))
            }
            _ => a.cmp(b),
        }
    }

    /// Parses the textual form of a key.
    pub fn parse(self, s: &str) -> Result<Bytes> {
        let invalid = || Error::Routing(format!("{:?} is not a valid {:?} key", s, self));
        let key = match self {
            KeyType::Int => int_key(s.parse().map_err(|_| invalid())?),
            KeyType::LongInt => long_key(s.parse().map_err(|_| invalid())?),
            KeyType::Float => float_key(s.parse().map_err(|_| invalid())?),
            KeyType::Double => double_key(s.parse().map_err(|_| invalid())?),
            KeyType::String | KeyType::Bytes => Bytes::copy_from_slice(s.as_bytes()),
        };
        Ok(key)
    }

    /// Renders a key for display.
    pub fn format(self, key: &[u8]) -> String {
        match (self, key.len()) {
            (KeyType::Int, 4) => LittleEndian::read_i32(key).to_string(),
            (KeyType::LongInt, 8) => LittleEndian::read_i64(key).to_string(),
            (KeyType::Float, 4) => LittleEndian::read_f32(key).to_string(),
            (KeyType::Double, 8) => LittleEndian::read_f64(key).to_string(),
            (KeyType::String, _) => String::from_utf8_lossy(key).into_owned(),
            _ => format!("{:?}", key),
        }
    }
}

pub fn int_key(v: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_i32_le(v);
    buf.freeze()
}

pub fn long_key(v: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i64_le(v);
    buf.freeze()
}

pub fn float_key(v: f32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_f32_le(v);
    buf.freeze()
}

pub fn double_key(v: f64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_f64_le(v);
    buf.freeze()
}
