//! Server proof signing and certificate access.
//!
//! Certificate policy lives entirely behind [`ProofSigner`]; the handshake
//! only needs a proof over the CHLO and server config, plus the cert bytes
//! to hand the client.

use crate::aead::CryptoError;
use ed25519_dalek::{Signer as _, SigningKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

const PROOF_LABEL: &[u8] = b"QUIC CHLO and server config signature\x00";

/// Produces the server proof and certificate material for a given SNI.
pub trait ProofSigner: Send + Sync {
    /// Sign the proof binding the client hello to the server config.
    fn sign_server_proof(
        &self,
        sni: &str,
        chlo: &[u8],
        server_config_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// The certificate chain, compressed against the hashes the client
    /// already holds.
    fn get_certs_compressed(
        &self,
        sni: &str,
        common_set_hashes: &[u8],
        cached_hashes: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// The uncompressed leaf certificate, fed into key derivation.
    fn get_leaf_cert(&self, sni: &str) -> Result<Vec<u8>, CryptoError>;
}

/// The byte string the server proof signs.
pub fn server_proof_input(chlo: &[u8], server_config_data: &[u8]) -> Vec<u8> {
    let chlo_hash = Sha256::digest(chlo);
    let mut input =
        Vec::with_capacity(PROOF_LABEL.len() + 4 + chlo_hash.len() + server_config_data.len());
    input.extend_from_slice(PROOF_LABEL);
    input.extend_from_slice(&(chlo_hash.len() as u32).to_le_bytes());
    input.extend_from_slice(&chlo_hash);
    input.extend_from_slice(server_config_data);
    input
}

/// Ed25519-backed proof signer holding a single certificate chain.
pub struct Ed25519ProofSigner {
    key: SigningKey,
    cert_chain: Vec<u8>,
    leaf_cert: Vec<u8>,
}

impl Ed25519ProofSigner {
    pub fn new(cert_chain: Vec<u8>, leaf_cert: Vec<u8>) -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
            cert_chain,
            leaf_cert,
        }
    }

    pub fn with_key(key: SigningKey, cert_chain: Vec<u8>, leaf_cert: Vec<u8>) -> Self {
        Self {
            key,
            cert_chain,
            leaf_cert,
        }
    }

    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.key.verifying_key()
    }
}

impl ProofSigner for Ed25519ProofSigner {
    fn sign_server_proof(
        &self,
        _sni: &str,
        chlo: &[u8],
        server_config_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let input = server_proof_input(chlo, server_config_data);
        Ok(self.key.sign(&input).to_bytes().to_vec())
    }

    fn get_certs_compressed(
        &self,
        _sni: &str,
        _common_set_hashes: &[u8],
        _cached_hashes: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        Ok(self.cert_chain.clone())
    }

    fn get_leaf_cert(&self, _sni: &str) -> Result<Vec<u8>, CryptoError> {
        Ok(self.leaf_cert.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};

    #[test]
    fn proof_verifies_over_the_expected_input() {
        let signer = Ed25519ProofSigner::new(b"chain".to_vec(), b"leaf".to_vec());
        let proof = signer
            .sign_server_proof("example.com", b"chlo bytes", b"scfg bytes")
            .expect("sign");
        let signature = Signature::from_slice(&proof).expect("signature");
        let input = server_proof_input(b"chlo bytes", b"scfg bytes");
        signer
            .verifying_key()
            .verify(&input, &signature)
            .expect("verify");
    }

    #[test]
    fn proof_binds_the_chlo() {
        let signer = Ed25519ProofSigner::new(Vec::new(), Vec::new());
        let proof = signer
            .sign_server_proof("example.com", b"chlo bytes", b"scfg bytes")
            .expect("sign");
        let signature = Signature::from_slice(&proof).expect("signature");
        let other_input = server_proof_input(b"different chlo", b"scfg bytes");
        assert!(signer
            .verifying_key()
            .verify(&other_input, &signature)
            .is_err());
    }

    #[test]
    fn returns_the_configured_certificates() {
        let signer = Ed25519ProofSigner::new(b"chain".to_vec(), b"leaf".to_vec());
        assert_eq!(
            signer
                .get_certs_compressed("example.com", &[], &[])
                .expect("certs"),
            b"chain"
        );
        assert_eq!(
            signer.get_leaf_cert("example.com").expect("leaf"),
            b"leaf"
        );
    }
}
