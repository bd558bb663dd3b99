//! Minimal public header codec.
//!
//! Enough header to route a datagram to its connection and to authenticate
//! the header bytes as AEAD associated data. Server-to-client packets may
//! carry the 32-byte diversification nonce while the initial encryption
//! level is in effect.

use crate::protocol::{ConnectionId, PacketNumber};
use thiserror::Error;

const FLAG_CONNECTION_ID: u8 = 0x08;
const FLAG_DIVERSIFICATION_NONCE: u8 = 0x04;

pub const DIVERSIFICATION_NONCE_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("public header truncated")]
    Truncated,
    #[error("public header missing connection id")]
    MissingConnectionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicHeader {
    pub connection_id: ConnectionId,
    pub packet_number: PacketNumber,
    pub diversification_nonce: Option<[u8; DIVERSIFICATION_NONCE_LEN]>,
}

impl PublicHeader {
    pub fn write(&self, out: &mut Vec<u8>) {
        let mut flags = FLAG_CONNECTION_ID;
        if self.diversification_nonce.is_some() {
            flags |= FLAG_DIVERSIFICATION_NONCE;
        }
        out.push(flags);
        out.extend_from_slice(&self.connection_id.to_le_bytes());
        if let Some(nonce) = &self.diversification_nonce {
            out.extend_from_slice(nonce);
        }
        out.extend_from_slice(&self.packet_number.to_le_bytes());
    }

    /// Decode the header, returning it along with its encoded length. The
    /// header bytes double as the packet's AEAD associated data.
    pub fn parse(input: &[u8]) -> Result<(PublicHeader, usize), PacketError> {
        let (&flags, rest) = input.split_first().ok_or(PacketError::Truncated)?;
        if flags & FLAG_CONNECTION_ID == 0 {
            return Err(PacketError::MissingConnectionId);
        }
        if rest.len() < 8 {
            return Err(PacketError::Truncated);
        }
        let connection_id = u64::from_le_bytes(rest[0..8].try_into().unwrap());
        let mut offset = 9;

        let diversification_nonce = if flags & FLAG_DIVERSIFICATION_NONCE != 0 {
            if input.len() < offset + DIVERSIFICATION_NONCE_LEN {
                return Err(PacketError::Truncated);
            }
            let mut nonce = [0u8; DIVERSIFICATION_NONCE_LEN];
            nonce.copy_from_slice(&input[offset..offset + DIVERSIFICATION_NONCE_LEN]);
            offset += DIVERSIFICATION_NONCE_LEN;
            Some(nonce)
        } else {
            None
        };

        if input.len() < offset + 8 {
            return Err(PacketError::Truncated);
        }
        let packet_number = u64::from_le_bytes(input[offset..offset + 8].try_into().unwrap());
        offset += 8;

        Ok((
            PublicHeader {
                connection_id,
                packet_number,
                diversification_nonce,
            },
            offset,
        ))
    }

    /// Peek only the connection id, for routing.
    pub fn peek_connection_id(input: &[u8]) -> Result<ConnectionId, PacketError> {
        let (header, _) = Self::parse(input)?;
        Ok(header.connection_id)
    }
}
