//! Negotiated transport parameters.
//!
//! The client advertises its values in the CHLO; the server echoes its own
//! in the SHLO. Values the peer did not send keep their protocol defaults.

use crate::message::{parse_uint32, MessageError, Tag};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;

/// Stream-level flow control window this server advertises.
pub const RECEIVE_STREAM_FLOW_CONTROL_WINDOW: u32 = 32 * 1024;
/// Connection-level flow control window this server advertises.
pub const RECEIVE_CONNECTION_FLOW_CONTROL_WINDOW: u32 = 48 * 1024;
/// Idle timeout this server advertises and enforces as an upper bound.
pub const MAX_IDLE_CONNECTION_STATE_LIFETIME: Duration = Duration::from_secs(60);
/// Streams per connection this server allows.
pub const MAX_STREAMS_PER_CONNECTION: u32 = 100;

const DEFAULT_IDLE_CONNECTION_STATE_LIFETIME: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Params {
    send_stream_flow_control_window: u32,
    send_connection_flow_control_window: u32,
    idle_connection_state_lifetime: Duration,
    max_streams_per_connection: u32,
}

/// Holds the current parameter set for one connection.
///
/// Read from both the session and the crypto setup, hence the lock.
#[derive(Debug)]
pub struct ConnectionParametersManager {
    params: RwLock<Params>,
}

impl ConnectionParametersManager {
    pub fn new() -> Self {
        Self {
            params: RwLock::new(Params {
                send_stream_flow_control_window: RECEIVE_STREAM_FLOW_CONTROL_WINDOW,
                send_connection_flow_control_window: RECEIVE_CONNECTION_FLOW_CONTROL_WINDOW,
                idle_connection_state_lifetime: DEFAULT_IDLE_CONNECTION_STATE_LIFETIME,
                max_streams_per_connection: MAX_STREAMS_PER_CONNECTION,
            }),
        }
    }

    /// Apply the parameters a CHLO carried.
    pub fn set_from_map(&self, params: &BTreeMap<Tag, Vec<u8>>) -> Result<(), MessageError> {
        let mut inner = self.params.write();
        if let Some(value) = params.get(&Tag::SFCW) {
            inner.send_stream_flow_control_window = parse_uint32(value)?;
        }
        if let Some(value) = params.get(&Tag::CFCW) {
            inner.send_connection_flow_control_window = parse_uint32(value)?;
        }
        if let Some(value) = params.get(&Tag::ICSL) {
            let requested = Duration::from_secs(parse_uint32(value)? as u64);
            inner.idle_connection_state_lifetime =
                requested.min(MAX_IDLE_CONNECTION_STATE_LIFETIME);
        }
        if let Some(value) = params.get(&Tag::MSPC) {
            inner.max_streams_per_connection =
                parse_uint32(value)?.min(MAX_STREAMS_PER_CONNECTION);
        }
        Ok(())
    }

    /// The parameter map the server sends back in its SHLO.
    pub fn get_shlo_map(&self) -> BTreeMap<Tag, Vec<u8>> {
        let inner = self.params.read();
        let mut map = BTreeMap::new();
        map.insert(
            Tag::SFCW,
            RECEIVE_STREAM_FLOW_CONTROL_WINDOW.to_le_bytes().to_vec(),
        );
        map.insert(
            Tag::CFCW,
            RECEIVE_CONNECTION_FLOW_CONTROL_WINDOW
                .to_le_bytes()
                .to_vec(),
        );
        map.insert(
            Tag::ICSL,
            (inner.idle_connection_state_lifetime.as_secs() as u32)
                .to_le_bytes()
                .to_vec(),
        );
        map.insert(
            Tag::MSPC,
            inner.max_streams_per_connection.to_le_bytes().to_vec(),
        );
        map
    }

    /// Window limiting our stream-level sends, as advertised by the peer.
    pub fn send_stream_flow_control_window(&self) -> u32 {
        self.params.read().send_stream_flow_control_window
    }

    /// Window limiting our connection-level sends, as advertised by the peer.
    pub fn send_connection_flow_control_window(&self) -> u32 {
        self.params.read().send_connection_flow_control_window
    }

    pub fn idle_connection_state_lifetime(&self) -> Duration {
        self.params.read().idle_connection_state_lifetime
    }

    pub fn max_streams_per_connection(&self) -> u32 {
        self.params.read().max_streams_per_connection
    }
}

impl Default for ConnectionParametersManager {
    fn default() -> Self {
        Self::new()
    }
}
