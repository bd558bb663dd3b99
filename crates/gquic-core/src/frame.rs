//! Stream frames and the minimal frame wire codec.
//!
//! This is deliberately not the full gQUIC frame zoo: the server only needs
//! stream frames to move handshake and application bytes, padding to absorb
//! client hello inflation, and connection close to report fatal errors.

use crate::protocol::{ByteCount, StreamId};
use bytes::Bytes;
use thiserror::Error;

const FRAME_TYPE_STREAM: u8 = 0x80;
const FRAME_FLAG_FIN: u8 = 0x40;
const FRAME_TYPE_CONNECTION_CLOSE: u8 = 0x02;
const FRAME_TYPE_PADDING: u8 = 0x00;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated")]
    Truncated,
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
}

/// A chunk of stream data at a byte offset, optionally closing the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: ByteCount,
    pub data: Bytes,
    pub fin: bool,
}

impl StreamFrame {
    pub fn data_len(&self) -> ByteCount {
        self.data.len() as ByteCount
    }

    fn write(&self, out: &mut Vec<u8>) {
        let mut type_byte = FRAME_TYPE_STREAM;
        if self.fin {
            type_byte |= FRAME_FLAG_FIN;
        }
        out.push(type_byte);
        out.extend_from_slice(&self.stream_id.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.data);
    }
}

/// Frames the server understands in a decrypted packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Stream(StreamFrame),
    ConnectionClose { error_code: u32, reason: String },
}

impl Frame {
    pub fn write(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Stream(frame) => frame.write(out),
            Frame::ConnectionClose { error_code, reason } => {
                out.push(FRAME_TYPE_CONNECTION_CLOSE);
                out.extend_from_slice(&error_code.to_le_bytes());
                out.extend_from_slice(&(reason.len() as u16).to_le_bytes());
                out.extend_from_slice(reason.as_bytes());
            }
        }
    }
}

/// Parse every frame in a decrypted packet payload.
///
/// A padding frame swallows the remainder of the payload, mirroring how
/// clients pad their hellos up to the minimum size.
pub fn parse_frames(payload: &[u8]) -> Result<Vec<Frame>, FrameError> {
    let mut frames = Vec::new();
    let mut rest = payload;
    while let Some((&type_byte, after)) = rest.split_first() {
        if type_byte == FRAME_TYPE_PADDING {
            break;
        }
        if type_byte & FRAME_TYPE_STREAM != 0 {
            let (frame, consumed) = parse_stream_frame(type_byte, after)?;
            frames.push(Frame::Stream(frame));
            rest = &after[consumed..];
        } else if type_byte == FRAME_TYPE_CONNECTION_CLOSE {
            let (frame, consumed) = parse_connection_close(after)?;
            frames.push(frame);
            rest = &after[consumed..];
        } else {
            return Err(FrameError::UnknownType(type_byte));
        }
    }
    Ok(frames)
}

fn parse_stream_frame(type_byte: u8, input: &[u8]) -> Result<(StreamFrame, usize), FrameError> {
    if input.len() < 4 + 8 + 2 {
        return Err(FrameError::Truncated);
    }
    let stream_id = u32::from_le_bytes(input[0..4].try_into().unwrap());
    let offset = u64::from_le_bytes(input[4..12].try_into().unwrap());
    let data_len = u16::from_le_bytes(input[12..14].try_into().unwrap()) as usize;
    let end = 14 + data_len;
    if input.len() < end {
        return Err(FrameError::Truncated);
    }
    Ok((
        StreamFrame {
            stream_id,
            offset,
            data: Bytes::copy_from_slice(&input[14..end]),
            fin: type_byte & FRAME_FLAG_FIN != 0,
        },
        end,
    ))
}

fn parse_connection_close(input: &[u8]) -> Result<(Frame, usize), FrameError> {
    if input.len() < 4 + 2 {
        return Err(FrameError::Truncated);
    }
    let error_code = u32::from_le_bytes(input[0..4].try_into().unwrap());
    let reason_len = u16::from_le_bytes(input[4..6].try_into().unwrap()) as usize;
    let end = 6 + reason_len;
    if input.len() < end {
        return Err(FrameError::Truncated);
    }
    let reason = String::from_utf8_lossy(&input[6..end]).into_owned();
    Ok((Frame::ConnectionClose { error_code, reason }, end))
}
