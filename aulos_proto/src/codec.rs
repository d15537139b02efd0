//! Binary encoding of TLV trees.
//!
//! Every TLV is written as an 8 byte header (`tag: u32`, `len: u32`, both
//! big-endian), where `len` excludes the header, followed by its payload:
//!
//! - integers are 4 bytes, big-endian,
//! - strings are NUL-padded to the next multiple of 4 (always at least one
//!   NUL byte),
//! - binary blobs are written verbatim,
//! - containers hold the concatenated encodings of their children.
//!
//! Decoding walks the buffer with a bounds-checked [`Cursor`], never reading
//! past the end of the enclosing scope.

use crate::tlv::{Kind, Tag, Tlv, Value};
use alloc::{string::String, vec::Vec};

/// Size of a TLV header.
pub const TLV_HEADER_LEN: usize = 8;

/// Containers nested deeper than this are rejected.
pub const MAX_DEPTH: usize = 32;

/// Errors occuring while decoding a TLV tree or a message.
///
/// All of them are local to the offending buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("buffer truncated at offset {offset}: {needed} bytes needed, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("tlv {tag} declares {len} bytes, but only {available} remain in its scope")]
    LengthViolation {
        tag: Tag,
        len: u32,
        available: usize,
    },
    #[error("scope {tag} should end at offset {expected}, decoding stopped at {actual}")]
    EndMismatch {
        tag: Tag,
        expected: usize,
        actual: usize,
    },
    #[error("integer tlv {tag} has length {len}, expected 4")]
    IntegerLength { tag: Tag, len: u32 },
    #[error("container {tag} holds more than one link")]
    DuplicateLink { tag: Tag },
    #[error("containers nested deeper than {} levels", MAX_DEPTH)]
    TooDeep,
    #[error("header declares {declared} bytes, buffer holds {actual}")]
    LengthMismatch { declared: u32, actual: usize },
}

/// A read position over `buf[pos..end]`.
///
/// Every read is checked against `end` before touching the buffer.
#[derive(Debug, Clone)]
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
    // invariant: pos <= end <= buf.len()
}

impl<'a> Cursor<'a> {
    #[inline(always)]
    pub(crate) const fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            end: buf.len(),
        }
    }

    #[inline(always)]
    pub(crate) const fn remaining(&self) -> usize {
        self.end - self.pos
    }

    #[inline(always)]
    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }

        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    #[inline(always)]
    pub(crate) fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(size_of::<u32>())?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Splits off the next `len` bytes as a child cursor, advancing past them.
    ///
    /// `len` must have been checked against [`remaining`](Self::remaining).
    #[inline(always)]
    fn scope(&mut self, len: usize) -> Self {
        debug_assert!(len <= self.remaining());
        let child = Self {
            buf: self.buf,
            pos: self.pos,
            end: self.pos + len,
        };
        self.pos += len;
        child
    }
}

/// The result of decoding a TLV list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub tlvs: Vec<Tlv>,
    /// Set if at least one TLV with an unknown tag was skipped.
    pub had_unknown: bool,
}

/// Decodes a flat list of top-level TLVs spanning the whole of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Decoded, DecodeError> {
    let mut had_unknown = false;
    let tlvs = decode_scope(&mut Cursor::new(bytes), Tag::ROOT, 0, &mut had_unknown)?;
    Ok(Decoded { tlvs, had_unknown })
}

fn decode_scope(
    cur: &mut Cursor<'_>,
    scope: Tag,
    depth: usize,
    had_unknown: &mut bool,
) -> Result<Vec<Tlv>, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::TooDeep);
    }

    let mut tlvs = Vec::new();
    let mut seen_link = false;

    while cur.remaining() >= TLV_HEADER_LEN {
        let tag = Tag(cur.read_u32()?);
        let len = cur.read_u32()?;

        let available = cur.remaining();
        if u64::from(len) > available as u64 {
            return Err(DecodeError::LengthViolation {
                tag,
                len,
                available,
            });
        }
        // bounded by `available` above
        let span = len as usize;

        let value = match tag.kind() {
            None => {
                log::debug!("skipping unknown tlv {tag} ({len} bytes) in {scope}");
                cur.take(span)?;
                *had_unknown = true;
                continue;
            }
            Some(Kind::Integer) => {
                if span != size_of::<u32>() {
                    return Err(DecodeError::IntegerLength { tag, len });
                }
                Value::Integer(cur.read_u32()?)
            }
            Some(Kind::String) => Value::String(decode_str(cur.take(span)?)),
            Some(Kind::Binary) => Value::Binary(cur.take(span)?.to_vec()),
            Some(Kind::Container) => {
                let mut inner = cur.scope(span);
                Value::Container(decode_scope(&mut inner, tag, depth + 1, had_unknown)?)
            }
        };

        if tag == Tag::LINK && scope.has_unique_link() {
            if seen_link {
                return Err(DecodeError::DuplicateLink { tag: scope });
            }
            seen_link = true;
        }

        tlvs.push(Tlv { tag, value });
    }

    if cur.pos != cur.end {
        return Err(DecodeError::EndMismatch {
            tag: scope,
            expected: cur.end,
            actual: cur.pos,
        });
    }

    Ok(tlvs)
}

/// Strings ending in NUL stop at their first NUL, others span all their bytes.
fn decode_str(span: &[u8]) -> String {
    let span = match span.last() {
        Some(0) => {
            let nul = span.iter().position(|&b| b == 0).unwrap_or(span.len());
            &span[..nul]
        }
        _ => span,
    };

    String::from_utf8_lossy(span).into_owned()
}

/// Number of NUL bytes appended to a string of `len` bytes.
#[inline(always)]
const fn str_padding(len: usize) -> usize {
    4 - len % 4
}

/// Appends the encoding of every TLV in `tlvs` to `out`.
pub fn encode(tlvs: &[Tlv], out: &mut Vec<u8>) {
    out.reserve(encoded_len(tlvs));
    for tlv in tlvs {
        encode_tlv(tlv, out);
    }
}

fn encode_tlv(tlv: &Tlv, out: &mut Vec<u8>) {
    out.extend_from_slice(&tlv.tag.get().to_be_bytes());
    let len_pos = out.len();
    // back-patched below
    out.extend_from_slice(&[0; 4]);
    let body_start = out.len();

    match &tlv.value {
        Value::Integer(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::String(s) => {
            out.extend_from_slice(s.as_bytes());
            out.resize(out.len() + str_padding(s.len()), 0);
        }
        Value::Binary(b) => out.extend_from_slice(b),
        Value::Container(children) => {
            for child in children {
                encode_tlv(child, out);
            }
        }
    }

    // messages are capped far below 4 GiB by the framer
    let len = (out.len() - body_start) as u32;
    out[len_pos..body_start].copy_from_slice(&len.to_be_bytes());
}

/// Returns the number of bytes [`encode`] appends for `tlvs`.
pub fn encoded_len(tlvs: &[Tlv]) -> usize {
    tlvs.iter()
        .map(|tlv| {
            TLV_HEADER_LEN
                + match &tlv.value {
                    Value::Integer(_) => size_of::<u32>(),
                    Value::String(s) => s.len() + str_padding(s.len()),
                    Value::Binary(b) => b.len(),
                    Value::Container(c) => encoded_len(c),
                }
        })
        .sum()
}
