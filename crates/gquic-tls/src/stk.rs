//! Source-address tokens.
//!
//! An STK proves a client previously received bytes at its claimed address,
//! blunting amplification from spoofed hellos. Tokens are sealed with a
//! server-wide ChaCha20-Poly1305 key and bind the client IP and an issue
//! timestamp; peers sharing the key can verify each other's tokens.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const TIMESTAMP_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StkError {
    #[error("source-address token truncated")]
    Truncated,
    #[error("source-address token failed to authenticate")]
    Invalid,
    #[error("source-address token expired")]
    Expired,
    #[error("source-address token bound to a different address")]
    AddressMismatch,
}

/// Mints and verifies source-address tokens.
pub trait StkSource: Send + Sync {
    fn new_token(&self, ip: IpAddr) -> Result<Vec<u8>, StkError>;
    fn verify_token(&self, ip: IpAddr, token: &[u8]) -> Result<(), StkError>;
}

/// AEAD-sealed token source.
pub struct StkGenerator {
    aead: ChaCha20Poly1305,
    lifetime: Duration,
}

impl StkGenerator {
    pub fn new(key: [u8; 32], lifetime: Duration) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&key)),
            lifetime,
        }
    }

    /// A generator with a random key. Tokens die with the process.
    pub fn ephemeral(lifetime: Duration) -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self::new(key, lifetime)
    }

    fn verify_at(&self, ip: IpAddr, token: &[u8], now: SystemTime) -> Result<(), StkError> {
        if token.len() < NONCE_LEN + TAG_LEN + TIMESTAMP_LEN {
            return Err(StkError::Truncated);
        }
        let (nonce_bytes, ciphertext) = token.split_at(NONCE_LEN);
        let plaintext = self
            .aead
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| StkError::Invalid)?;
        if plaintext.len() < TIMESTAMP_LEN {
            return Err(StkError::Invalid);
        }
        let (ts_bytes, ip_bytes) = plaintext.split_at(TIMESTAMP_LEN);
        let issued_secs = u64::from_be_bytes(ts_bytes.try_into().unwrap());
        let issued = UNIX_EPOCH + Duration::from_secs(issued_secs);
        if now > issued + self.lifetime {
            return Err(StkError::Expired);
        }
        if ip_bytes != ip_octets(ip).as_slice() {
            return Err(StkError::AddressMismatch);
        }
        Ok(())
    }
}

fn ip_octets(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

impl StkSource for StkGenerator {
    fn new_token(&self, ip: IpAddr) -> Result<Vec<u8>, StkError> {
        let issued = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let octets = ip_octets(ip);
        let mut plaintext = Vec::with_capacity(TIMESTAMP_LEN + octets.len());
        plaintext.extend_from_slice(&issued.to_be_bytes());
        plaintext.extend_from_slice(&octets);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|_| StkError::Invalid)?;

        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&ciphertext);
        Ok(token)
    }

    fn verify_token(&self, ip: IpAddr, token: &[u8]) -> Result<(), StkError> {
        self.verify_at(ip, token, SystemTime::now())
    }
}
