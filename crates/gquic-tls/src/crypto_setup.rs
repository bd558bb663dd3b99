//! The handshake state machine.
//!
//! Drives the CHLO/REJ/SHLO exchange for one connection and decides which
//! AEAD seals and opens each packet. Encryption escalates monotonically:
//! null integrity protection, then the initial AEAD derived from the server
//! config's static key, then the forward-secure AEAD derived from an
//! ephemeral exchange. Once the client proves it holds a stronger level,
//! weaker levels are refused for good.

use crate::aead::{Aead, CryptoError, NullAead};
use crate::key_derivation::{default_key_derivation, KeyDerivationFn, KeyDerivationParams};
use crate::key_exchange::{new_curve25519_key_exchange, KeyExchangeFn};
use crate::server_config::ServerConfig;
use crate::stk::StkError;
use gquic_core::{
    ConnectionId, ConnectionParametersManager, HandshakeMessage, MessageError, PacketNumber, Tag,
    VersionNumber, CLIENT_HELLO_MINIMUM_SIZE, SUPPORTED_VERSIONS_AS_TAGS,
};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

/// Identifier sent in the SVID tag of REJ messages.
const SERVER_ID: &[u8] = b"gquic-rs";

/// Versions after this one get a proof and cert chain in their REJ.
const LAST_PROOFLESS_VERSION: VersionNumber = 30;
/// Versions from this one on get a diversification nonce on
/// initial-encryption packets.
const DIVERSIFICATION_MIN_VERSION: VersionNumber = 33;

const CLIENT_NONCE_LEN: usize = 32;
const SERVER_NONCE_LEN: usize = 32;
pub const DIVERSIFICATION_NONCE_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("CryptoMessageParameterNotFound: {0}")]
    ParameterNotFound(&'static str),
    #[error("CryptoInvalidValueLength: {0}")]
    InvalidValueLength(&'static str),
    #[error("InvalidCryptoMessageType: expected CHLO")]
    InvalidMessageType,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Stk(#[from] StkError),
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Outcome of feeding one CHLO to the state machine.
#[derive(Debug)]
pub struct HandshakeReply {
    /// Serialized REJ or SHLO to write back on the crypto stream.
    pub message: Vec<u8>,
    /// True once the SHLO above completed the handshake.
    pub completed: bool,
}

/// Per-connection handshake state. Owned by the connection's session task
/// and never shared.
pub struct CryptoSetup {
    connection_id: ConnectionId,
    ip: IpAddr,
    version: VersionNumber,
    scfg: Arc<ServerConfig>,
    nonce: [u8; SERVER_NONCE_LEN],
    null_aead: NullAead,
    secure_aead: Option<Box<dyn Aead>>,
    forward_secure_aead: Option<Box<dyn Aead>>,
    received_secure_packet: bool,
    received_forward_secure_packet: bool,
    div_nonce: Option<[u8; DIVERSIFICATION_NONCE_LEN]>,
    connection_parameters: Arc<ConnectionParametersManager>,
    aead_changed: mpsc::Sender<()>,
    key_derivation: KeyDerivationFn,
    key_exchange: KeyExchangeFn,
}

impl CryptoSetup {
    pub fn new(
        connection_id: ConnectionId,
        ip: IpAddr,
        version: VersionNumber,
        scfg: Arc<ServerConfig>,
        connection_parameters: Arc<ConnectionParametersManager>,
        aead_changed: mpsc::Sender<()>,
    ) -> Self {
        let mut nonce = [0u8; SERVER_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        Self {
            connection_id,
            ip,
            version,
            scfg,
            nonce,
            null_aead: NullAead,
            secure_aead: None,
            forward_secure_aead: None,
            received_secure_packet: false,
            received_forward_secure_packet: false,
            div_nonce: None,
            connection_parameters,
            aead_changed,
            key_derivation: default_key_derivation,
            key_exchange: new_curve25519_key_exchange,
        }
    }

    /// Process one CHLO.
    ///
    /// `data` is the raw serialized message, `params` its decoded tag map.
    /// Inchoate hellos (missing or stale SCID, missing or failing STK) get a
    /// REJ carrying everything the client needs to retry; complete hellos
    /// install both AEADs and get the SHLO.
    pub fn handle_message(
        &mut self,
        data: &[u8],
        params: &BTreeMap<Tag, Vec<u8>>,
    ) -> Result<HandshakeReply, HandshakeError> {
        let sni = params
            .get(&Tag::SNI)
            .filter(|value| !value.is_empty())
            .ok_or(HandshakeError::ParameterNotFound("SNI required"))?;
        let sni = std::str::from_utf8(sni)
            .map_err(|_| HandshakeError::InvalidValueLength("SNI not valid UTF-8"))?
            .to_owned();

        if self.is_inchoate_chlo(params) {
            let message = self.handle_inchoate_chlo(&sni, data, params)?;
            return Ok(HandshakeReply {
                message,
                completed: false,
            });
        }

        let message = self.handle_chlo(&sni, data, params)?;
        Ok(HandshakeReply {
            message,
            completed: true,
        })
    }

    /// A CHLO is inchoate unless it references our current server config and
    /// carries a source-address token that verifies for the client address.
    fn is_inchoate_chlo(&self, params: &BTreeMap<Tag, Vec<u8>>) -> bool {
        match params.get(&Tag::SCID) {
            Some(scid) if scid.as_slice() == self.scfg.id() => {}
            _ => return true,
        }
        let stk = params.get(&Tag::STK).map(Vec::as_slice).unwrap_or(&[]);
        self.scfg.verify_stk(self.ip, stk).is_err()
    }

    fn handle_inchoate_chlo(
        &self,
        sni: &str,
        data: &[u8],
        params: &BTreeMap<Tag, Vec<u8>>,
    ) -> Result<Vec<u8>, HandshakeError> {
        if data.len() < CLIENT_HELLO_MINIMUM_SIZE {
            return Err(HandshakeError::InvalidValueLength("CHLO too small"));
        }

        let token = self.scfg.new_stk(self.ip)?;

        let mut reply = BTreeMap::new();
        reply.insert(Tag::SCFG, self.scfg.serialized().to_vec());
        reply.insert(Tag::STK, token);
        reply.insert(Tag::SVID, SERVER_ID.to_vec());

        if self.version > LAST_PROOFLESS_VERSION {
            let proof = self.scfg.sign(sni, data)?;
            let common_set_hashes = params.get(&Tag::CCS).map(Vec::as_slice).unwrap_or(&[]);
            let cached_hashes = params.get(&Tag::CCRT).map(Vec::as_slice).unwrap_or(&[]);
            let certs = self
                .scfg
                .get_certs_compressed(sni, common_set_hashes, cached_hashes)?;
            reply.insert(Tag::CERT, certs);
            reply.insert(Tag::PROF, proof);
        }

        Ok(HandshakeMessage::new(Tag::REJ, reply).serialize())
    }

    fn handle_chlo(
        &mut self,
        sni: &str,
        data: &[u8],
        params: &BTreeMap<Tag, Vec<u8>>,
    ) -> Result<Vec<u8>, HandshakeError> {
        let client_pubs = params
            .get(&Tag::PUBS)
            .ok_or(HandshakeError::ParameterNotFound("PUBS required"))?;
        let client_nonce = params
            .get(&Tag::NONC)
            .ok_or(HandshakeError::ParameterNotFound("NONC required"))?;
        if client_nonce.len() != CLIENT_NONCE_LEN {
            return Err(HandshakeError::InvalidValueLength(
                "invalid client nonce length",
            ));
        }

        let shared_secret = Zeroizing::new(self.scfg.calculate_shared_key(client_pubs)?);
        let leaf_cert = self.scfg.get_leaf_cert(sni)?;

        let mut div_nonce = [0u8; DIVERSIFICATION_NONCE_LEN];
        OsRng.fill_bytes(&mut div_nonce);
        self.div_nonce = Some(div_nonce);

        let secure_aead = (self.key_derivation)(&KeyDerivationParams {
            version: self.version,
            forward_secure: false,
            shared_secret: &shared_secret,
            nonces: client_nonce,
            connection_id: self.connection_id,
            chlo: data,
            scfg: self.scfg.serialized(),
            cert: &leaf_cert,
            div_nonce: &div_nonce,
        })?;
        self.secure_aead = Some(secure_aead);

        // Fresh exchange for forward secrecy; its secret never persists
        // beyond this connection.
        let ephemeral_kex = (self.key_exchange)()?;
        let ephemeral_shared = Zeroizing::new(ephemeral_kex.calculate_shared_key(client_pubs)?);

        let mut fs_nonce = Zeroizing::new([0u8; CLIENT_NONCE_LEN + SERVER_NONCE_LEN]);
        fs_nonce[..CLIENT_NONCE_LEN].copy_from_slice(client_nonce);
        fs_nonce[CLIENT_NONCE_LEN..].copy_from_slice(&self.nonce);

        let forward_secure_aead = (self.key_derivation)(&KeyDerivationParams {
            version: self.version,
            forward_secure: true,
            shared_secret: &ephemeral_shared,
            nonces: &*fs_nonce,
            connection_id: self.connection_id,
            chlo: data,
            scfg: self.scfg.serialized(),
            cert: &leaf_cert,
            div_nonce: &[],
        })?;
        self.forward_secure_aead = Some(forward_secure_aead);

        self.connection_parameters.set_from_map(params)?;
        let mut reply = self.connection_parameters.get_shlo_map();
        reply.insert(Tag::PUBS, ephemeral_kex.public_key());
        reply.insert(Tag::SNO, self.nonce.to_vec());
        reply.insert(Tag::VER, SUPPORTED_VERSIONS_AS_TAGS.clone());

        let message = HandshakeMessage::new(Tag::SHLO, reply).serialize();

        // One-slot signal; if the session has not drained the previous one
        // it already knows something changed.
        let _ = self.aead_changed.try_send(());

        Ok(message)
    }

    /// Seal an outbound packet at the current encryption level.
    pub fn seal(
        &self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Vec<u8> {
        if self.received_forward_secure_packet {
            if let Some(aead) = &self.forward_secure_aead {
                return aead.seal(packet_number, associated_data, plaintext);
            }
        }
        if let Some(aead) = &self.secure_aead {
            return aead.seal(packet_number, associated_data, plaintext);
        }
        self.null_aead.seal(packet_number, associated_data, plaintext)
    }

    /// Open an inbound packet, trying the strongest installed AEAD first.
    ///
    /// A success at a level permanently forbids all weaker levels: accepting
    /// them again would hand an attacker a downgrade.
    pub fn open(
        &mut self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if let Some(aead) = &self.forward_secure_aead {
            match aead.open(packet_number, associated_data, ciphertext) {
                Ok(plaintext) => {
                    self.received_forward_secure_packet = true;
                    return Ok(plaintext);
                }
                Err(err) => {
                    if self.received_forward_secure_packet {
                        return Err(err);
                    }
                }
            }
        }
        if let Some(aead) = &self.secure_aead {
            match aead.open(packet_number, associated_data, ciphertext) {
                Ok(plaintext) => {
                    self.received_secure_packet = true;
                    return Ok(plaintext);
                }
                Err(err) => {
                    if self.received_secure_packet {
                        return Err(err);
                    }
                }
            }
        }
        self.null_aead
            .open(packet_number, associated_data, ciphertext)
    }

    /// The nonce to advertise in packet headers while the initial AEAD's
    /// diversification window is open.
    pub fn diversification_nonce(&self) -> Option<&[u8; DIVERSIFICATION_NONCE_LEN]> {
        if self.version >= DIVERSIFICATION_MIN_VERSION
            && self.secure_aead.is_some()
            && !self.received_forward_secure_packet
        {
            return self.div_nonce.as_ref();
        }
        None
    }

    /// True once a forward-secure packet has been accepted from the client.
    pub fn forward_secure(&self) -> bool {
        self.received_forward_secure_packet
    }
}
