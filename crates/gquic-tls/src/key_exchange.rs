//! Key exchange abstraction and the Curve25519 implementation.

use crate::aead::CryptoError;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// A Diffie-Hellman style key exchange.
///
/// The server config holds a long-lived instance; a fresh ephemeral one is
/// generated per connection for the forward-secure keys.
pub trait KeyExchange: Send + Sync {
    fn public_key(&self) -> Vec<u8>;
    fn calculate_shared_key(&self, other_public: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Signature of the ephemeral key exchange factory, injectable for tests.
pub type KeyExchangeFn = fn() -> Result<Box<dyn KeyExchange>, CryptoError>;

/// Curve25519 key exchange, the `C255` KEXS.
pub struct Curve25519KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
}

impl Curve25519KeyExchange {
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

impl Default for Curve25519KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchange for Curve25519KeyExchange {
    fn public_key(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    fn calculate_shared_key(&self, other_public: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let other: [u8; 32] = other_public
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(other));
        Ok(shared.as_bytes().to_vec())
    }
}

/// Default ephemeral factory used by the crypto setup.
pub fn new_curve25519_key_exchange() -> Result<Box<dyn KeyExchange>, CryptoError> {
    Ok(Box::new(Curve25519KeyExchange::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree_on_the_shared_key() {
        let alice = Curve25519KeyExchange::new();
        let bob = Curve25519KeyExchange::new();
        let shared_a = alice
            .calculate_shared_key(&bob.public_key())
            .expect("alice");
        let shared_b = bob
            .calculate_shared_key(&alice.public_key())
            .expect("bob");
        assert_eq!(shared_a, shared_b);
        assert_eq!(shared_a.len(), 32);
    }

    #[test]
    fn rejects_malformed_public_keys() {
        let kex = Curve25519KeyExchange::new();
        assert!(kex.calculate_shared_key(b"short").is_err());
    }

    #[test]
    fn distinct_instances_have_distinct_keys() {
        let a = Curve25519KeyExchange::new();
        let b = Curve25519KeyExchange::new();
        assert_ne!(a.public_key(), b.public_key());
    }
}
