//! Per-connection session.
//!
//! A session owns all connection state: the crypto setup, one sorter per
//! receive stream, and the negotiated parameters. It is driven one datagram
//! at a time by its connection task and returns the datagrams to send back;
//! nothing here touches the socket.

use bytes::Bytes;
use gquic_core::{
    parse_frames, ByteCount, ConnectionId, ConnectionParametersManager, Frame, FrameError,
    HandshakeMessage, MessageError, PacketNumber, PublicHeader, SorterError, StreamFrame,
    StreamFrameSorter, StreamId, Tag, VersionNumber, CRYPTO_STREAM_ID,
};
use gquic_tls::{CryptoSetup, HandshakeError, ServerConfig};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Stream frame payload ceiling for outbound packets.
const MAX_STREAM_FRAME_DATA: usize = 1200;

// Error codes carried in CONNECTION_CLOSE frames.
const ERROR_INTERNAL: u32 = 1;
const ERROR_INVALID_CRYPTO_MESSAGE_TYPE: u32 = 22;
const ERROR_CRYPTO_INVALID_VALUE_LENGTH: u32 = 23;
const ERROR_CRYPTO_MESSAGE_PARAMETER_NOT_FOUND: u32 = 24;
const ERROR_INVALID_STREAM_DATA: u32 = 46;
const ERROR_OVERLAPPING_STREAM_DATA: u32 = 87;

/// Why a session shut down.
#[derive(Debug, Error)]
pub enum CloseReason {
    #[error("peer closed the connection: {reason} ({error_code})")]
    PeerClosed { error_code: u32, reason: String },
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
    #[error("stream data error: {0}")]
    StreamData(SorterError),
    #[error("undecodable handshake message: {0}")]
    CryptoMessage(#[from] MessageError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

impl CloseReason {
    fn error_code(&self) -> u32 {
        match self {
            CloseReason::PeerClosed { error_code, .. } => *error_code,
            CloseReason::Frame(_) => ERROR_INVALID_STREAM_DATA,
            CloseReason::StreamData(SorterError::OverlappingStreamData) => {
                ERROR_OVERLAPPING_STREAM_DATA
            }
            CloseReason::StreamData(_) => ERROR_INTERNAL,
            CloseReason::CryptoMessage(_) => ERROR_INVALID_CRYPTO_MESSAGE_TYPE,
            CloseReason::Handshake(err) => match err {
                HandshakeError::ParameterNotFound(_) => ERROR_CRYPTO_MESSAGE_PARAMETER_NOT_FOUND,
                HandshakeError::InvalidValueLength(_) => ERROR_CRYPTO_INVALID_VALUE_LENGTH,
                HandshakeError::InvalidMessageType => ERROR_INVALID_CRYPTO_MESSAGE_TYPE,
                _ => ERROR_INTERNAL,
            },
        }
    }
}

/// One gQUIC connection.
pub struct Session {
    connection_id: ConnectionId,
    crypto: CryptoSetup,
    aead_changed: mpsc::Receiver<()>,
    params: Arc<ConnectionParametersManager>,
    streams: HashMap<StreamId, StreamFrameSorter>,
    crypto_buffer: Vec<u8>,
    crypto_send_offset: ByteCount,
    stream_send_offsets: HashMap<StreamId, ByteCount>,
    next_packet_number: PacketNumber,
    handshake_complete: bool,
    lenient_stream_data: bool,
    close_reason: Option<CloseReason>,
}

impl Session {
    pub fn new(
        connection_id: ConnectionId,
        ip: IpAddr,
        version: VersionNumber,
        scfg: Arc<ServerConfig>,
    ) -> Self {
        let params = Arc::new(ConnectionParametersManager::new());
        let (aead_changed_tx, aead_changed_rx) = mpsc::channel(1);
        let crypto = CryptoSetup::new(
            connection_id,
            ip,
            version,
            scfg,
            Arc::clone(&params),
            aead_changed_tx,
        );
        Self {
            connection_id,
            crypto,
            aead_changed: aead_changed_rx,
            params,
            streams: HashMap::new(),
            crypto_buffer: Vec::new(),
            crypto_send_offset: 0,
            stream_send_offsets: HashMap::new(),
            next_packet_number: 1,
            handshake_complete: false,
            lenient_stream_data: false,
            close_reason: None,
        }
    }

    /// Drop overlapping stream frames instead of closing the connection.
    pub fn with_lenient_stream_data(mut self) -> Self {
        self.lenient_stream_data = true;
        self
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.is_some()
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn is_forward_secure(&self) -> bool {
        self.crypto.forward_secure()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.params.idle_connection_state_lifetime()
    }

    /// Process one inbound datagram, returning the datagrams to send back.
    ///
    /// Undecryptable datagrams are dropped without a trace on the wire.
    /// Protocol violations queue a CONNECTION_CLOSE and mark the session
    /// closed; the caller sends what was returned, then tears the
    /// connection down.
    pub fn handle_datagram(&mut self, datagram: &[u8]) -> Vec<Vec<u8>> {
        let (header, header_len) = match PublicHeader::parse(datagram) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(target: "gquic::session", error = %err, "dropping undecodable datagram");
                return Vec::new();
            }
        };
        let associated_data = &datagram[..header_len];

        let plaintext = match self.crypto.open(
            header.packet_number,
            associated_data,
            &datagram[header_len..],
        ) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                debug!(
                    target: "gquic::session",
                    packet_number = header.packet_number,
                    error = %err,
                    "dropping packet that failed to authenticate"
                );
                return Vec::new();
            }
        };

        let frames = match parse_frames(&plaintext) {
            Ok(frames) => frames,
            Err(err) => return self.close(CloseReason::Frame(err)),
        };

        let mut out = Vec::new();
        for frame in frames {
            match frame {
                Frame::ConnectionClose { error_code, reason } => {
                    info!(
                        target: "gquic::session",
                        error_code,
                        reason = %reason,
                        "peer closed the connection"
                    );
                    self.close_reason = Some(CloseReason::PeerClosed { error_code, reason });
                    return out;
                }
                Frame::Stream(frame) => {
                    if let Some(close) = self.handle_stream_frame(frame) {
                        out.extend(close);
                        return out;
                    }
                }
            }
        }

        if let Some(close) = self.drive_crypto_stream(&mut out) {
            out.extend(close);
            return out;
        }

        while self.aead_changed.try_recv().is_ok() {
            debug!(target: "gquic::session", "encryption level escalated");
        }

        out
    }

    /// Returns the close datagrams if the frame was fatal.
    fn handle_stream_frame(&mut self, frame: StreamFrame) -> Option<Vec<Vec<u8>>> {
        let stream_id = frame.stream_id;
        let result = self.streams.entry(stream_id).or_default().push(frame);
        match result {
            Ok(()) => None,
            Err(err @ (SorterError::DuplicateStreamData | SorterError::EmptyStreamData)) => {
                trace!(target: "gquic::session", stream_id, error = %err, "dropping stream frame");
                None
            }
            Err(err @ SorterError::OverlappingStreamData) if self.lenient_stream_data => {
                debug!(
                    target: "gquic::session",
                    stream_id,
                    error = %err,
                    "dropping overlapping stream frame"
                );
                None
            }
            Err(err) => Some(self.close(CloseReason::StreamData(err))),
        }
    }

    /// Feed newly contiguous crypto stream bytes into the handshake and seal
    /// any REJ/SHLO replies. Returns close datagrams on a fatal error.
    fn drive_crypto_stream(&mut self, out: &mut Vec<Vec<u8>>) -> Option<Vec<Vec<u8>>> {
        if let Some(sorter) = self.streams.get_mut(&CRYPTO_STREAM_ID) {
            while let Some(frame) = sorter.pop() {
                self.crypto_buffer.extend_from_slice(&frame.data);
            }
        }

        loop {
            let (message, consumed) = match HandshakeMessage::parse(&self.crypto_buffer) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => return None,
                Err(err) => return Some(self.close(CloseReason::CryptoMessage(err))),
            };

            if message.tag != Tag::CHLO {
                warn!(target: "gquic::session", tag = %message.tag, "unexpected handshake message");
                return Some(self.close(CloseReason::Handshake(
                    HandshakeError::InvalidMessageType,
                )));
            }

            let raw = self.crypto_buffer[..consumed].to_vec();
            self.crypto_buffer.drain(..consumed);

            match self.crypto.handle_message(&raw, &message.params) {
                Ok(reply) => {
                    if reply.completed {
                        info!(
                            target: "gquic::session",
                            connection_id = self.connection_id,
                            "handshake complete"
                        );
                        self.handshake_complete = true;
                    }
                    self.send_crypto_data(&reply.message, out);
                }
                Err(err) => return Some(self.close(CloseReason::Handshake(err))),
            }
        }
    }

    fn send_crypto_data(&mut self, data: &[u8], out: &mut Vec<Vec<u8>>) {
        for chunk in data.chunks(MAX_STREAM_FRAME_DATA) {
            let frame = Frame::Stream(StreamFrame {
                stream_id: CRYPTO_STREAM_ID,
                offset: self.crypto_send_offset,
                data: Bytes::copy_from_slice(chunk),
                fin: false,
            });
            self.crypto_send_offset += chunk.len() as ByteCount;
            let packet = self.seal_packet(&[frame]);
            out.push(packet);
        }
    }

    /// Queue application data, returning the sealed datagrams.
    pub fn send_stream_data(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if data.is_empty() {
            if fin {
                let offset = *self.stream_send_offsets.entry(stream_id).or_insert(0);
                let frame = Frame::Stream(StreamFrame {
                    stream_id,
                    offset,
                    data: Bytes::new(),
                    fin: true,
                });
                let packet = self.seal_packet(&[frame]);
                out.push(packet);
            }
            return out;
        }

        let mut chunks = data.chunks(MAX_STREAM_FRAME_DATA).peekable();
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let offset = *self.stream_send_offsets.entry(stream_id).or_insert(0);
            let frame = Frame::Stream(StreamFrame {
                stream_id,
                offset,
                data: Bytes::copy_from_slice(chunk),
                fin: fin && last,
            });
            *self.stream_send_offsets.entry(stream_id).or_insert(0) += chunk.len() as ByteCount;
            let packet = self.seal_packet(&[frame]);
            out.push(packet);
        }
        out
    }

    /// In-order application data, if the next chunk has arrived.
    pub fn pop_stream_data(&mut self, stream_id: StreamId) -> Option<StreamFrame> {
        self.streams.get_mut(&stream_id)?.pop()
    }

    fn seal_packet(&mut self, frames: &[Frame]) -> Vec<u8> {
        let packet_number = self.next_packet_number;
        self.next_packet_number += 1;

        let header = PublicHeader {
            connection_id: self.connection_id,
            packet_number,
            diversification_nonce: self.crypto.diversification_nonce().copied(),
        };
        let mut datagram = Vec::new();
        header.write(&mut datagram);
        let header_len = datagram.len();

        let mut payload = Vec::new();
        for frame in frames {
            frame.write(&mut payload);
        }
        let sealed = self
            .crypto
            .seal(packet_number, &datagram[..header_len], &payload);
        datagram.extend_from_slice(&sealed);
        datagram
    }

    fn close(&mut self, reason: CloseReason) -> Vec<Vec<u8>> {
        warn!(target: "gquic::session", reason = %reason, "closing connection");
        let frame = Frame::ConnectionClose {
            error_code: reason.error_code(),
            reason: reason.to_string(),
        };
        let packet = self.seal_packet(&[frame]);
        self.close_reason = Some(reason);
        vec![packet]
    }
}
