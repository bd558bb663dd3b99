//! Tag-value handshake message codec.
//!
//! Wire layout:
//!
//! ```text
//! | tag (4B) | num_entries (u16 LE) | padding (2B) |
//! | entry_tag_0 (4B) | end_off_0 (u32 LE) | ... |
//! | concatenated values |
//! ```
//!
//! Entries are sorted by tag bytes; each `end_off` is the exclusive end of
//! that entry's value within the value region. The decoder rejects
//! out-of-order or duplicate tags and non-monotonic offsets.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Upper bound on entries in a single message.
const MAX_ENTRIES: usize = 64;
/// Upper bound on the total value region of a single message.
const MAX_VALUE_REGION: usize = 1 << 20;

const HEADER_LEN: usize = 8;
const INDEX_ENTRY_LEN: usize = 8;

/// 4-byte message or parameter tag. Short tags are zero-padded.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub [u8; 4]);

impl Tag {
    pub const CHLO: Tag = Tag(*b"CHLO");
    pub const REJ: Tag = Tag(*b"REJ\0");
    pub const SHLO: Tag = Tag(*b"SHLO");
    pub const SCFG: Tag = Tag(*b"SCFG");

    pub const SNI: Tag = Tag(*b"SNI\0");
    pub const STK: Tag = Tag(*b"STK\0");
    pub const SCID: Tag = Tag(*b"SCID");
    pub const PUBS: Tag = Tag(*b"PUBS");
    pub const NONC: Tag = Tag(*b"NONC");
    pub const SNO: Tag = Tag(*b"SNO\0");
    pub const VER: Tag = Tag(*b"VER\0");
    pub const KEXS: Tag = Tag(*b"KEXS");
    pub const AEAD: Tag = Tag(*b"AEAD");
    pub const OBIT: Tag = Tag(*b"OBIT");
    pub const EXPY: Tag = Tag(*b"EXPY");
    pub const CERT: Tag = Tag(*b"CERT");
    pub const PROF: Tag = Tag(*b"PROF");
    pub const SVID: Tag = Tag(*b"SVID");
    pub const XLCT: Tag = Tag(*b"XLCT");
    pub const PAD: Tag = Tag(*b"PAD\0");
    pub const CCS: Tag = Tag(*b"CCS\0");
    pub const CCRT: Tag = Tag(*b"CCRT");

    pub const SFCW: Tag = Tag(*b"SFCW");
    pub const CFCW: Tag = Tag(*b"CFCW");
    pub const ICSL: Tag = Tag(*b"ICSL");
    pub const MSPC: Tag = Tag(*b"MSPC");
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b == 0 {
                break;
            }
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("handshake message declares too many entries")]
    TooManyEntries,
    #[error("handshake message value region exceeds limit")]
    ValueRegionTooLarge,
    #[error("handshake message tags out of order")]
    TagsOutOfOrder,
    #[error("handshake message offsets not monotonic")]
    OffsetsNotMonotonic,
    #[error("integer parameter has wrong length")]
    InvalidIntegerLength,
}

/// A decoded tag-value handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub tag: Tag,
    pub params: BTreeMap<Tag, Vec<u8>>,
}

impl HandshakeMessage {
    pub fn new(tag: Tag, params: BTreeMap<Tag, Vec<u8>>) -> Self {
        Self { tag, params }
    }

    /// Try to decode a message from the front of `input`.
    ///
    /// Returns `Ok(None)` while the buffer does not yet hold a complete
    /// message, and `Ok(Some((message, consumed)))` once it does.
    pub fn parse(input: &[u8]) -> Result<Option<(HandshakeMessage, usize)>, MessageError> {
        if input.len() < HEADER_LEN {
            return Ok(None);
        }
        let tag = Tag(input[0..4].try_into().unwrap());
        let num_entries = u16::from_le_bytes(input[4..6].try_into().unwrap()) as usize;
        if num_entries > MAX_ENTRIES {
            return Err(MessageError::TooManyEntries);
        }

        let index_end = HEADER_LEN + num_entries * INDEX_ENTRY_LEN;
        if input.len() < index_end {
            return Ok(None);
        }

        let mut entries = Vec::with_capacity(num_entries);
        let mut prev_tag: Option<Tag> = None;
        let mut prev_end = 0u32;
        for i in 0..num_entries {
            let base = HEADER_LEN + i * INDEX_ENTRY_LEN;
            let entry_tag = Tag(input[base..base + 4].try_into().unwrap());
            let end_off = u32::from_le_bytes(input[base + 4..base + 8].try_into().unwrap());
            if let Some(prev) = prev_tag {
                if entry_tag <= prev {
                    return Err(MessageError::TagsOutOfOrder);
                }
            }
            if end_off < prev_end {
                return Err(MessageError::OffsetsNotMonotonic);
            }
            entries.push((entry_tag, prev_end as usize, end_off as usize));
            prev_tag = Some(entry_tag);
            prev_end = end_off;
        }

        let value_region = prev_end as usize;
        if value_region > MAX_VALUE_REGION {
            return Err(MessageError::ValueRegionTooLarge);
        }
        let total = index_end + value_region;
        if input.len() < total {
            return Ok(None);
        }

        let values = &input[index_end..total];
        let mut params = BTreeMap::new();
        for (entry_tag, start, end) in entries {
            params.insert(entry_tag, values[start..end].to_vec());
        }
        Ok(Some((HandshakeMessage { tag, params }, total)))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out);
        out
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tag.0);
        out.extend_from_slice(&(self.params.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0u8; 2]);

        // BTreeMap iteration yields the required tag order.
        let mut end_off = 0u32;
        for (tag, value) in &self.params {
            end_off += value.len() as u32;
            out.extend_from_slice(&tag.0);
            out.extend_from_slice(&end_off.to_le_bytes());
        }
        for value in self.params.values() {
            out.extend_from_slice(value);
        }
    }
}

/// Decode a little-endian u32 parameter value.
pub fn parse_uint32(data: &[u8]) -> Result<u32, MessageError> {
    let bytes: [u8; 4] = data
        .try_into()
        .map_err(|_| MessageError::InvalidIntegerLength)?;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HandshakeMessage {
        let mut params = BTreeMap::new();
        params.insert(Tag::SNI, b"example.com".to_vec());
        params.insert(Tag::STK, b"token".to_vec());
        params.insert(Tag::NONC, vec![0u8; 32]);
        HandshakeMessage::new(Tag::CHLO, params)
    }

    #[test]
    fn roundtrip() {
        let msg = sample();
        let serialized = msg.serialize();
        let (parsed, consumed) = HandshakeMessage::parse(&serialized)
            .expect("parse")
            .expect("complete");
        assert_eq!(parsed, msg);
        assert_eq!(consumed, serialized.len());
    }

    #[test]
    fn serialized_message_starts_with_the_tag() {
        let serialized = sample().serialize();
        assert_eq!(&serialized[0..4], b"CHLO");
    }

    #[test]
    fn incomplete_input_returns_none() {
        let serialized = sample().serialize();
        for len in 0..serialized.len() {
            assert_eq!(
                HandshakeMessage::parse(&serialized[..len]).expect("parse"),
                None,
                "prefix of length {len} should be incomplete"
            );
        }
    }

    #[test]
    fn parses_a_message_with_trailing_data() {
        let mut buf = sample().serialize();
        let message_len = buf.len();
        buf.extend_from_slice(b"next message bytes");
        let (_, consumed) = HandshakeMessage::parse(&buf)
            .expect("parse")
            .expect("complete");
        assert_eq!(consumed, message_len);
    }

    #[test]
    fn rejects_out_of_order_tags() {
        let mut buf = sample().serialize();
        // Swap the first two index entries.
        let (a, b) = (8, 16);
        for i in 0..8 {
            buf.swap(a + i, b + i);
        }
        assert_eq!(
            HandshakeMessage::parse(&buf),
            Err(MessageError::TagsOutOfOrder)
        );
    }

    #[test]
    fn rejects_duplicate_tags() {
        let msg = sample();
        let mut buf = msg.serialize();
        // Overwrite the second entry tag with a copy of the first.
        buf.copy_within(8..12, 16);
        assert_eq!(
            HandshakeMessage::parse(&buf),
            Err(MessageError::TagsOutOfOrder)
        );
    }

    #[test]
    fn rejects_non_monotonic_offsets() {
        let mut params = BTreeMap::new();
        params.insert(Tag::SNI, b"example.com".to_vec());
        params.insert(Tag::STK, b"token".to_vec());
        let mut buf = HandshakeMessage::new(Tag::CHLO, params).serialize();
        // First entry claims an end offset beyond the second entry's.
        buf[12..16].copy_from_slice(&100u32.to_le_bytes());
        assert_eq!(
            HandshakeMessage::parse(&buf),
            Err(MessageError::OffsetsNotMonotonic)
        );
    }

    #[test]
    fn rejects_too_many_entries() {
        let mut buf = sample().serialize();
        buf[4..6].copy_from_slice(&1000u16.to_le_bytes());
        assert_eq!(
            HandshakeMessage::parse(&buf),
            Err(MessageError::TooManyEntries)
        );
    }

    #[test]
    fn parses_little_endian_integers() {
        assert_eq!(parse_uint32(&[0x39, 0x30, 0, 0]).expect("parse"), 12345);
        assert_eq!(
            parse_uint32(&[1, 2, 3]),
            Err(MessageError::InvalidIntegerLength)
        );
    }
}
