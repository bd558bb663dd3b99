//! The server config (SCFG).
//!
//! A long-lived, signed bundle of key-exchange material shared by every
//! connection. Immutable once constructed; its serialization is computed
//! eagerly and reused for the lifetime of the process.

use crate::aead::CryptoError;
use crate::key_exchange::KeyExchange;
use crate::signer::ProofSigner;
use crate::stk::{StkError, StkGenerator, StkSource};
use gquic_core::{HandshakeMessage, Tag, SUPPORTED_VERSIONS_AS_TAGS};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How long a server config stays valid after construction.
const SERVER_CONFIG_VALIDITY: Duration = Duration::from_secs(60 * 60 * 24 * 30);
/// How long minted source-address tokens stay valid.
const STK_LIFETIME: Duration = Duration::from_secs(60 * 60 * 24);

pub const SERVER_CONFIG_ID_LEN: usize = 16;

pub struct ServerConfig {
    id: [u8; SERVER_CONFIG_ID_LEN],
    kex: Box<dyn KeyExchange>,
    signer: Arc<dyn ProofSigner>,
    stk_source: Box<dyn StkSource>,
    serialized: Vec<u8>,
}

impl ServerConfig {
    pub fn new(kex: Box<dyn KeyExchange>, signer: Arc<dyn ProofSigner>) -> Self {
        let mut id = [0u8; SERVER_CONFIG_ID_LEN];
        OsRng.fill_bytes(&mut id);
        let mut obit = [0u8; 8];
        OsRng.fill_bytes(&mut obit);
        let expiry = SystemTime::now() + SERVER_CONFIG_VALIDITY;
        let expiry_secs = expiry
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let public_key = kex.public_key();
        let mut pubs = Vec::with_capacity(3 + public_key.len());
        // 24-bit little-endian length prefix.
        pubs.extend_from_slice(&(public_key.len() as u32).to_le_bytes()[..3]);
        pubs.extend_from_slice(&public_key);

        let mut params = BTreeMap::new();
        params.insert(Tag::SCID, id.to_vec());
        params.insert(Tag::KEXS, b"C255".to_vec());
        params.insert(Tag::AEAD, b"CC20".to_vec());
        params.insert(Tag::PUBS, pubs);
        params.insert(Tag::OBIT, obit.to_vec());
        params.insert(Tag::EXPY, expiry_secs.to_le_bytes().to_vec());
        params.insert(Tag::VER, SUPPORTED_VERSIONS_AS_TAGS.clone());
        let serialized = HandshakeMessage::new(Tag::SCFG, params).serialize();

        Self {
            id,
            kex,
            signer,
            stk_source: Box::new(StkGenerator::ephemeral(STK_LIFETIME)),
            serialized,
        }
    }

    /// Replace the source-address token source, e.g. with one sharing a key
    /// across a cluster.
    pub fn with_stk_source(mut self, stk_source: Box<dyn StkSource>) -> Self {
        self.stk_source = stk_source;
        self
    }

    pub fn id(&self) -> &[u8; SERVER_CONFIG_ID_LEN] {
        &self.id
    }

    /// The memoized SCFG serialization advertised in REJ messages.
    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }

    /// The long-term key exchange's public key.
    pub fn public_key(&self) -> Vec<u8> {
        self.kex.public_key()
    }

    /// Shared key between the config's static key exchange and a client
    /// ephemeral public key.
    pub fn calculate_shared_key(&self, client_public: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.kex.calculate_shared_key(client_public)
    }

    /// Sign the server proof over a client hello and this config.
    pub fn sign(&self, sni: &str, chlo: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.signer.sign_server_proof(sni, chlo, &self.serialized)
    }

    pub fn get_certs_compressed(
        &self,
        sni: &str,
        common_set_hashes: &[u8],
        cached_hashes: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.signer
            .get_certs_compressed(sni, common_set_hashes, cached_hashes)
    }

    pub fn get_leaf_cert(&self, sni: &str) -> Result<Vec<u8>, CryptoError> {
        self.signer.get_leaf_cert(sni)
    }

    pub fn new_stk(&self, ip: IpAddr) -> Result<Vec<u8>, StkError> {
        self.stk_source.new_token(ip)
    }

    pub fn verify_stk(&self, ip: IpAddr, token: &[u8]) -> Result<(), StkError> {
        self.stk_source.verify_token(ip, token)
    }
}
