//! Protocol-wide constants and the supported version set.

use once_cell::sync::Lazy;

/// A byte offset or byte count on a stream.
pub type ByteCount = u64;

/// Packet number, scoped to a connection.
pub type PacketNumber = u64;

/// Stream identifier. Stream 1 carries the crypto handshake.
pub type StreamId = u32;

/// 64-bit opaque connection identifier, chosen by the client.
pub type ConnectionId = u64;

/// gQUIC wire version number (the numeric part of a `Q0xx` tag).
pub type VersionNumber = u32;

/// The stream id the cryptographic handshake runs on.
pub const CRYPTO_STREAM_ID: StreamId = 1;

/// Upper bound for byte offsets on a stream.
pub const MAX_BYTE_COUNT: ByteCount = (1 << 62) - 1;

/// Maximum number of unfilled gaps a single receive stream may accumulate
/// before further fragmentation is treated as an attack.
pub const MAX_STREAM_FRAME_SORTER_GAPS: usize = 1000;

/// Minimum size of an inchoate client hello. Forces clients to pay for the
/// amplification a REJ response represents.
pub const CLIENT_HELLO_MINIMUM_SIZE: usize = 1024;

/// Versions this server speaks, in ascending order.
pub const SUPPORTED_VERSIONS: [VersionNumber; 4] = [30, 31, 32, 33];

/// The 4-byte wire tag for a version number, e.g. `Q033`.
pub fn version_number_to_tag(version: VersionNumber) -> [u8; 4] {
    [
        b'Q',
        b'0' + ((version / 100) % 10) as u8,
        b'0' + ((version / 10) % 10) as u8,
        b'0' + (version % 10) as u8,
    ]
}

/// Concatenated version tags of [`SUPPORTED_VERSIONS`], as advertised in
/// SHLO and SCFG messages.
pub static SUPPORTED_VERSIONS_AS_TAGS: Lazy<Vec<u8>> = Lazy::new(|| {
    let mut tags = Vec::with_capacity(SUPPORTED_VERSIONS.len() * 4);
    for version in SUPPORTED_VERSIONS {
        tags.extend_from_slice(&version_number_to_tag(version));
    }
    tags
});

/// Highest version this server speaks.
pub fn highest_supported_version() -> VersionNumber {
    SUPPORTED_VERSIONS[SUPPORTED_VERSIONS.len() - 1]
}

pub fn is_supported_version(version: VersionNumber) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}
