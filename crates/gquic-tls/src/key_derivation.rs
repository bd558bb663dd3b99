//! HKDF-SHA256 key expansion and key diversification.

use crate::aead::{Aead, ChaCha20Poly1305Aead, CryptoError};
use gquic_core::{ConnectionId, VersionNumber};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

const LABEL_INITIAL: &[u8] = b"QUIC key expansion\x00";
const LABEL_FORWARD_SECURE: &[u8] = b"QUIC forward secure key expansion\x00";
const LABEL_DIVERSIFICATION: &[u8] = b"QUIC key diversification";

/// The version from which the server diversifies its initial send key.
const DIVERSIFICATION_MIN_VERSION: VersionNumber = 33;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 4;

/// Inputs to one key expansion.
pub struct KeyDerivationParams<'a> {
    pub version: VersionNumber,
    pub forward_secure: bool,
    pub shared_secret: &'a [u8],
    pub nonces: &'a [u8],
    pub connection_id: ConnectionId,
    pub chlo: &'a [u8],
    pub scfg: &'a [u8],
    pub cert: &'a [u8],
    pub div_nonce: &'a [u8],
}

/// Signature of the key derivation step, injectable for tests.
pub type KeyDerivationFn = fn(&KeyDerivationParams<'_>) -> Result<Box<dyn Aead>, CryptoError>;

/// Derive both directions' keys and IVs and build the matching
/// ChaCha20-Poly1305 instance.
pub fn derive_keys_chacha20(
    p: &KeyDerivationParams<'_>,
) -> Result<ChaCha20Poly1305Aead, CryptoError> {
    let mut info = Vec::with_capacity(
        LABEL_FORWARD_SECURE.len() + 8 + p.chlo.len() + p.scfg.len() + p.cert.len(),
    );
    if p.forward_secure {
        info.extend_from_slice(LABEL_FORWARD_SECURE);
    } else {
        info.extend_from_slice(LABEL_INITIAL);
    }
    info.extend_from_slice(&p.connection_id.to_le_bytes());
    info.extend_from_slice(p.chlo);
    info.extend_from_slice(p.scfg);
    info.extend_from_slice(p.cert);

    let hkdf = Hkdf::<Sha256>::new(Some(p.nonces), p.shared_secret);
    let mut okm = Zeroizing::new([0u8; 2 * (KEY_LEN + IV_LEN)]);
    hkdf.expand(&info, okm.as_mut())
        .map_err(|_| CryptoError::KeyDerivation)?;

    let (other_key, rest) = okm.split_at(KEY_LEN);
    let (my_key, rest) = rest.split_at(KEY_LEN);
    let (other_iv, my_iv) = rest.split_at(IV_LEN);

    let mut my_key = Zeroizing::new(<[u8; KEY_LEN]>::try_from(my_key).unwrap());
    let mut my_iv = Zeroizing::new(<[u8; IV_LEN]>::try_from(my_iv).unwrap());

    if !p.forward_secure && p.version >= DIVERSIFICATION_MIN_VERSION {
        diversify(&mut my_key, &mut my_iv, p.div_nonce)?;
    }

    ChaCha20Poly1305Aead::new(other_key, &*my_key, other_iv, &*my_iv)
}

/// Mix the diversification nonce into the server's send key and IV, so the
/// keys observed on the wire cannot be correlated across connections.
fn diversify(
    key: &mut [u8; KEY_LEN],
    iv: &mut [u8; IV_LEN],
    div_nonce: &[u8],
) -> Result<(), CryptoError> {
    let mut secret = Zeroizing::new([0u8; KEY_LEN + IV_LEN]);
    secret[..KEY_LEN].copy_from_slice(key);
    secret[KEY_LEN..].copy_from_slice(iv);

    let hkdf = Hkdf::<Sha256>::new(Some(div_nonce), secret.as_ref());
    let mut okm = Zeroizing::new([0u8; KEY_LEN + IV_LEN]);
    hkdf.expand(LABEL_DIVERSIFICATION, okm.as_mut())
        .map_err(|_| CryptoError::KeyDerivation)?;

    key.copy_from_slice(&okm[..KEY_LEN]);
    iv.copy_from_slice(&okm[KEY_LEN..]);
    Ok(())
}

/// Default derivation used by the crypto setup.
pub fn default_key_derivation(p: &KeyDerivationParams<'_>) -> Result<Box<dyn Aead>, CryptoError> {
    Ok(Box::new(derive_keys_chacha20(p)?))
}
