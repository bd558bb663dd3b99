//! Packet protection.
//!
//! Two AEADs cover the lifetime of a connection: the null AEAD authenticates
//! pre-handshake packets with an FNV-128a tag, and ChaCha20-Poly1305 takes
//! over once keys are derived.

use chacha20poly1305::aead::{Aead as _, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use gquic_core::PacketNumber;
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("ciphertext too short")]
    CiphertextTooShort,
    #[error("invalid key material")]
    InvalidKeyMaterial,
    #[error("key derivation failed")]
    KeyDerivation,
}

/// Seals and opens packet payloads at one encryption level.
pub trait Aead: Send {
    fn seal(
        &self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Vec<u8>;

    fn open(
        &self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

const NULL_AEAD_TAG_LEN: usize = 12;

const FNV128A_OFFSET: u128 = 0x6c62272e07bb014262b821756295c58d;
const FNV128A_PRIME: u128 = 0x0000000001000000000000000000013B;

fn fnv128a(associated_data: &[u8], plaintext: &[u8]) -> u128 {
    let mut hash = FNV128A_OFFSET;
    for &byte in associated_data.iter().chain(plaintext) {
        hash ^= byte as u128;
        hash = hash.wrapping_mul(FNV128A_PRIME);
    }
    hash
}

/// Integrity-only protection used until the first real AEAD is installed.
///
/// The 12-byte tag is the FNV-128a hash of associated data and plaintext,
/// truncated to the low 64 bits followed by the next 32, both little-endian.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAead;

impl Aead for NullAead {
    fn seal(
        &self,
        _packet_number: PacketNumber,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Vec<u8> {
        let hash = fnv128a(associated_data, plaintext);
        let mut out = Vec::with_capacity(NULL_AEAD_TAG_LEN + plaintext.len());
        out.extend_from_slice(&(hash as u64).to_le_bytes());
        out.extend_from_slice(&((hash >> 64) as u32).to_le_bytes());
        out.extend_from_slice(plaintext);
        out
    }

    fn open(
        &self,
        _packet_number: PacketNumber,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NULL_AEAD_TAG_LEN {
            return Err(CryptoError::CiphertextTooShort);
        }
        let (tag, plaintext) = ciphertext.split_at(NULL_AEAD_TAG_LEN);
        let hash = fnv128a(associated_data, plaintext);
        let low = u64::from_le_bytes(tag[0..8].try_into().unwrap());
        let high = u32::from_le_bytes(tag[8..12].try_into().unwrap());
        if low != hash as u64 || high != (hash >> 64) as u32 {
            return Err(CryptoError::AuthenticationFailed);
        }
        Ok(plaintext.to_vec())
    }
}

/// ChaCha20-Poly1305 with per-direction keys and 4-byte IVs.
///
/// The nonce is the direction's IV followed by the packet number in
/// little-endian, which keeps nonces unique as long as packet numbers are.
pub struct ChaCha20Poly1305Aead {
    opener: ChaCha20Poly1305,
    sealer: ChaCha20Poly1305,
    other_iv: [u8; 4],
    my_iv: [u8; 4],
}

impl ChaCha20Poly1305Aead {
    pub fn new(
        other_key: &[u8],
        my_key: &[u8],
        other_iv: &[u8],
        my_iv: &[u8],
    ) -> Result<Self, CryptoError> {
        if other_key.len() != 32 || my_key.len() != 32 || other_iv.len() != 4 || my_iv.len() != 4 {
            return Err(CryptoError::InvalidKeyMaterial);
        }
        let aead = Self {
            opener: ChaCha20Poly1305::new(Key::from_slice(other_key)),
            sealer: ChaCha20Poly1305::new(Key::from_slice(my_key)),
            other_iv: other_iv.try_into().unwrap(),
            my_iv: my_iv.try_into().unwrap(),
        };
        Ok(aead)
    }

    fn nonce(iv: &[u8; 4], packet_number: PacketNumber) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[0..4].copy_from_slice(iv);
        nonce[4..12].copy_from_slice(&packet_number.to_le_bytes());
        nonce
    }
}

impl Drop for ChaCha20Poly1305Aead {
    fn drop(&mut self) {
        self.other_iv.zeroize();
        self.my_iv.zeroize();
    }
}

impl Aead for ChaCha20Poly1305Aead {
    fn seal(
        &self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Vec<u8> {
        let nonce = Self::nonce(&self.my_iv, packet_number);
        self.sealer
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .expect("chacha20poly1305 encrypt")
    }

    fn open(
        &self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = Self::nonce(&self.other_iv, packet_number);
        self.opener
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: associated_data,
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // FNV-128a tag for associated data "" and plaintext "foobar".
    const FOOBAR_FNV_SIGNED: [u8; 18] = [
        0x18, 0x6f, 0x44, 0xba, 0x97, 0x35, 0x0d, 0x6f, 0xbf, 0x64, 0x3c, 0x79, 0x66, 0x6f, 0x6f,
        0x62, 0x61, 0x72,
    ];

    #[test]
    fn null_aead_seals_the_reference_vector() {
        let sealed = NullAead.seal(0, &[], b"foobar");
        assert_eq!(sealed, FOOBAR_FNV_SIGNED);
    }

    #[test]
    fn null_aead_opens_the_reference_vector() {
        let opened = NullAead.open(0, &[], &FOOBAR_FNV_SIGNED).expect("open");
        assert_eq!(opened, b"foobar");
    }

    #[test]
    fn null_aead_rejects_tampered_data() {
        let mut sealed = NullAead.seal(0, &[], b"foobar");
        sealed[13] ^= 0xFF;
        assert_eq!(
            NullAead.open(0, &[], &sealed),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn null_aead_binds_associated_data() {
        let sealed = NullAead.seal(0, b"header", b"foobar");
        assert_eq!(
            NullAead.open(0, b"other header", &sealed),
            Err(CryptoError::AuthenticationFailed)
        );
        assert!(NullAead.open(0, b"header", &sealed).is_ok());
    }

    #[test]
    fn null_aead_rejects_short_ciphertexts() {
        assert_eq!(
            NullAead.open(0, &[], &[0u8; 11]),
            Err(CryptoError::CiphertextTooShort)
        );
    }

    fn paired_aeads() -> (ChaCha20Poly1305Aead, ChaCha20Poly1305Aead) {
        let key_a = [1u8; 32];
        let key_b = [2u8; 32];
        let iv_a = [3u8; 4];
        let iv_b = [4u8; 4];
        let server = ChaCha20Poly1305Aead::new(&key_a, &key_b, &iv_a, &iv_b).expect("server");
        let client = ChaCha20Poly1305Aead::new(&key_b, &key_a, &iv_b, &iv_a).expect("client");
        (server, client)
    }

    #[test]
    fn chacha_roundtrip_between_directions() {
        let (server, client) = paired_aeads();
        let sealed = server.seal(7, b"hdr", b"payload");
        let opened = client.open(7, b"hdr", &sealed).expect("open");
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn chacha_rejects_wrong_packet_number() {
        let (server, client) = paired_aeads();
        let sealed = server.seal(7, b"hdr", b"payload");
        assert_eq!(
            client.open(8, b"hdr", &sealed),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn chacha_rejects_wrong_associated_data() {
        let (server, client) = paired_aeads();
        let sealed = server.seal(7, b"hdr", b"payload");
        assert_eq!(
            client.open(7, b"other", &sealed),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn chacha_requires_correct_key_lengths() {
        assert!(ChaCha20Poly1305Aead::new(&[0u8; 16], &[0u8; 32], &[0u8; 4], &[0u8; 4]).is_err());
        assert!(ChaCha20Poly1305Aead::new(&[0u8; 32], &[0u8; 32], &[0u8; 4], &[0u8; 12]).is_err());
    }
}
