//! Netlink attribute (rtattr/nlattr) handling.
//!
//! Attribute lists are parsed strictly: a length field that is shorter than
//! the attribute header or runs past the end of the list is an error, not a
//! silently truncated list. The codec turns that error into a synthetic
//! error record for the one message that carried it.

use bytes::Bytes;
use winnow::binary::{self, Endianness};
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::take;

use super::error::{Error, Result};

/// Netlink attribute alignment.
pub const NLA_ALIGNTO: usize = 4;

/// Align a length to NLA_ALIGNTO boundary.
#[inline]
pub const fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Size of the attribute header.
pub const NLA_HDRLEN: usize = 4;

/// Attribute type flags.
pub const NLA_F_NESTED: u16 = 1 << 15;
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

/// Result type for winnow parsers.
pub(crate) type PResult<T> = core::result::Result<T, ErrMode<ContextError>>;

fn ne_u16(input: &mut &[u8]) -> PResult<u16> {
    binary::u16(Endianness::Native).parse_next(input)
}

fn take_bytes<'a>(input: &mut &'a [u8], count: usize) -> PResult<&'a [u8]> {
    take(count).parse_next(input)
}

/// Parse one attribute header plus payload, consuming trailing padding.
pub(crate) fn parse_attr<'a>(input: &mut &'a [u8]) -> PResult<(u16, &'a [u8])> {
    let len = ne_u16(input)? as usize;
    let attr_type = ne_u16(input)?;

    if len < NLA_HDRLEN {
        return Err(ErrMode::Cut(ContextError::new()));
    }

    let payload = take_bytes(input, len - NLA_HDRLEN)?;

    let padding = nla_align(len) - len;
    if input.len() >= padding {
        take_bytes(input, padding)?;
    } else {
        *input = &input[input.len()..];
    }

    Ok((attr_type & NLA_TYPE_MASK, payload))
}

/// A single attribute: type code and raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    /// Attribute type with the nested/byte-order flags stripped.
    pub kind: u16,
    /// Payload bytes (shares the datagram buffer).
    pub value: Bytes,
}

/// Ordered list of attributes as they appeared on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attrs {
    list: Vec<Attr>,
}

impl Attrs {
    /// Create an empty attribute list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an attribute region. `data` must start at the first attribute.
    pub fn parse(data: &Bytes) -> Result<Self> {
        let mut list = Vec::new();
        let mut input: &[u8] = data;

        while !input.is_empty() {
            let offset = data.len() - input.len();
            let (kind, payload) = parse_attr(&mut input).map_err(|_| {
                Error::InvalidAttribute(format!(
                    "malformed attribute at offset {} of {}",
                    offset,
                    data.len()
                ))
            })?;
            list.push(Attr {
                kind,
                value: data.slice_ref(payload),
            });
        }

        Ok(Self { list })
    }

    /// Append an attribute.
    pub fn push(&mut self, kind: u16, value: impl Into<Bytes>) {
        self.list.push(Attr {
            kind,
            value: value.into(),
        });
    }

    /// First attribute of the given type.
    pub fn get(&self, kind: u16) -> Option<&Bytes> {
        self.list.iter().find(|a| a.kind == kind).map(|a| &a.value)
    }

    /// Iterate in wire order.
    pub fn iter(&self) -> std::slice::Iter<'_, Attr> {
        self.list.iter()
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// True if there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl<'a> IntoIterator for &'a Attrs {
    type Item = &'a Attr;
    type IntoIter = std::slice::Iter<'a, Attr>;

    fn into_iter(self) -> Self::IntoIter {
        self.list.iter()
    }
}

/// Helper functions for extracting typed values from attribute payloads.
pub mod get {
    use super::*;

    /// Extract a u32 value (native endian).
    pub fn u32_ne(data: &[u8]) -> Result<u32> {
        data.get(..4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_ne_bytes)
            .ok_or_else(|| Error::InvalidAttribute("truncated u32 attribute".into()))
    }

    /// Extract an i32 value (native endian).
    pub fn i32_ne(data: &[u8]) -> Result<i32> {
        data.get(..4)
            .and_then(|b| b.try_into().ok())
            .map(i32::from_ne_bytes)
            .ok_or_else(|| Error::InvalidAttribute("truncated i32 attribute".into()))
    }

    /// Extract a null-terminated string.
    pub fn string(data: &[u8]) -> Result<&str> {
        let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        std::str::from_utf8(&data[..len])
            .map_err(|e| Error::InvalidAttribute(format!("invalid UTF-8: {}", e)))
    }
}
