//! Canonical key encoding for dimension sets

use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt;

/// Canonical, order-independent key of a dimension set.
///
/// Layout per dimension, in name order:
/// `u32_be(len(name)) name u32_be(len(value)) value`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FactKey(Bytes);

impl FactKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Parse the escaped form produced by `Display`
    pub fn parse_escaped(raw: &str) -> Result<Self> {
        let bytes = raw.as_bytes();
        let mut out = BytesMut::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') {
                let hex = raw.get(i + 2..i + 4).ok_or_else(|| {
                    Error::Decode(format!("truncated escape at offset {} in '{}'", i, raw))
                })?;
                let byte = u8::from_str_radix(hex, 16).map_err(|e| {
                    Error::Decode(format!("bad escape '\\x{}' in '{}': {}", hex, raw, e))
                })?;
                out.put_u8(byte);
                i += 4;
            } else {
                out.put_u8(bytes[i]);
                i += 1;
            }
        }
        Ok(Self(out.freeze()))
    }
}

impl From<&[u8]> for FactKey {
    fn from(raw: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(raw))
    }
}

impl AsRef<[u8]> for FactKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Printable ASCII is kept as-is, everything else (and the backslash) becomes `\xNN`.
impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0.iter() {
            if (0x20..0x7f).contains(&b) && b != b'\\' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02X}", b)?;
            }
        }
        Ok(())
    }
}

/// Encode a dimension set into its canonical key
pub fn encode(dimensions: &BTreeMap<String, String>) -> FactKey {
    let size: usize = dimensions
        .iter()
        .map(|(k, v)| 8 + k.len() + v.len())
        .sum();
    let mut buf = BytesMut::with_capacity(size);
    for (name, value) in dimensions {
        buf.put_u32(name.len() as u32);
        buf.put_slice(name.as_bytes());
        buf.put_u32(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
    FactKey(buf.freeze())
}
