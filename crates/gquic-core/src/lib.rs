//! Core transport primitives for the gQUIC server.
//!
//! This crate holds the pieces with no I/O or crypto dependencies: protocol
//! constants, the stream frame sorter and its gap list, the tag-value
//! handshake message codec, the minimal wire codecs, and the negotiated
//! connection parameters.

pub mod frame;
pub mod interval;
pub mod message;
pub mod packet;
pub mod params;
pub mod protocol;
pub mod sorter;

pub use frame::{parse_frames, Frame, FrameError, StreamFrame};
pub use interval::{ByteInterval, GapList};
pub use message::{parse_uint32, HandshakeMessage, MessageError, Tag};
pub use packet::{PacketError, PublicHeader, DIVERSIFICATION_NONCE_LEN};
pub use params::ConnectionParametersManager;
pub use protocol::{
    ByteCount, ConnectionId, PacketNumber, StreamId, VersionNumber, CLIENT_HELLO_MINIMUM_SIZE,
    CRYPTO_STREAM_ID, MAX_BYTE_COUNT, MAX_STREAM_FRAME_SORTER_GAPS, SUPPORTED_VERSIONS,
    SUPPORTED_VERSIONS_AS_TAGS,
};
pub use sorter::{SorterError, StreamFrameSorter};
