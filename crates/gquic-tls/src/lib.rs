//! The gQUIC cryptographic stack.
//!
//! Everything a connection needs to escalate from cleartext to
//! forward-secure encryption: the AEADs, HKDF-SHA256 key derivation with
//! diversification, the Curve25519 key exchange, server proof signing,
//! source-address tokens, the shared server config, and the per-connection
//! crypto setup state machine that ties them together.

mod aead;
mod crypto_setup;
mod key_derivation;
mod key_exchange;
mod server_config;
mod signer;
mod stk;

pub use aead::{Aead, ChaCha20Poly1305Aead, CryptoError, NullAead};
pub use crypto_setup::{CryptoSetup, HandshakeError, HandshakeReply, DIVERSIFICATION_NONCE_LEN};
pub use key_derivation::{
    default_key_derivation, derive_keys_chacha20, KeyDerivationFn, KeyDerivationParams,
};
pub use key_exchange::{
    new_curve25519_key_exchange, Curve25519KeyExchange, KeyExchange, KeyExchangeFn,
};
pub use server_config::{ServerConfig, SERVER_CONFIG_ID_LEN};
pub use signer::{server_proof_input, Ed25519ProofSigner, ProofSigner};
pub use stk::{StkError, StkGenerator, StkSource};
