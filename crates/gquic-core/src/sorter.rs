//! Out-of-order stream frame reassembly.
//!
//! Frames arrive in arbitrary order, possibly duplicated. The sorter keys
//! them by offset, tracks the unreceived ranges in a [`GapList`], and hands
//! frames back in strict offset order. Overlapping retransmissions are
//! rejected rather than spliced: a well-behaved peer retransmits frames on
//! their original boundaries.

use crate::frame::StreamFrame;
use crate::interval::{FillError, GapList};
use crate::protocol::{ByteCount, MAX_STREAM_FRAME_SORTER_GAPS};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SorterError {
    #[error("empty stream frame without FIN")]
    EmptyStreamData,
    #[error("duplicate stream data")]
    DuplicateStreamData,
    #[error("overlapping stream data")]
    OverlappingStreamData,
    #[error("too many gaps in received stream data")]
    TooManyGaps,
}

/// Reassembles one receive stream.
pub struct StreamFrameSorter {
    queued_frames: HashMap<ByteCount, StreamFrame>,
    gaps: GapList,
    read_offset: ByteCount,
    final_offset: Option<ByteCount>,
}

impl StreamFrameSorter {
    pub fn new() -> Self {
        Self {
            queued_frames: HashMap::new(),
            gaps: GapList::new(),
            read_offset: 0,
            final_offset: None,
        }
    }

    /// Accept a frame.
    ///
    /// Duplicates are reported but leave the sorter untouched, so callers can
    /// ignore them. Overlaps and gap-cap violations are protocol errors.
    pub fn push(&mut self, frame: StreamFrame) -> Result<(), SorterError> {
        let start = frame.offset;
        let end = start.saturating_add(frame.data_len());

        if frame.fin {
            if let Some(final_offset) = self.final_offset {
                if final_offset != end {
                    return Err(SorterError::OverlappingStreamData);
                }
            }
        }

        if start == end {
            if !frame.fin {
                return Err(SorterError::EmptyStreamData);
            }
            // A bare FIN carries no bytes and does not touch the gap list.
            if self.queued_frames.contains_key(&start) {
                return Err(SorterError::DuplicateStreamData);
            }
            self.final_offset = Some(end);
            self.queued_frames.insert(start, frame);
            return Ok(());
        }

        if self.queued_frames.contains_key(&start) {
            return Err(SorterError::DuplicateStreamData);
        }

        self.gaps
            .fill(start, end, MAX_STREAM_FRAME_SORTER_GAPS)
            .map_err(|err| match err {
                FillError::AlreadyReceived => SorterError::DuplicateStreamData,
                FillError::Overlap => SorterError::OverlappingStreamData,
                FillError::TooManyGaps => SorterError::TooManyGaps,
            })?;

        if frame.fin {
            self.final_offset = Some(end);
        }
        self.queued_frames.insert(start, frame);
        Ok(())
    }

    /// The frame at the read offset, if it has arrived. Does not advance.
    pub fn head(&self) -> Option<&StreamFrame> {
        self.queued_frames.get(&self.read_offset)
    }

    /// Remove and return the frame at the read offset, advancing past it.
    pub fn pop(&mut self) -> Option<StreamFrame> {
        let frame = self.queued_frames.remove(&self.read_offset)?;
        self.read_offset += frame.data_len();
        Some(frame)
    }

    pub fn read_offset(&self) -> ByteCount {
        self.read_offset
    }

    pub fn final_offset(&self) -> Option<ByteCount> {
        self.final_offset
    }

    /// True once a FIN was accepted and every byte up to it was popped.
    pub fn finished(&self) -> bool {
        self.final_offset == Some(self.read_offset) && self.queued_frames.is_empty()
    }

    #[cfg(test)]
    fn gap_list(&self) -> &GapList {
        &self.gaps
    }
}

impl Default for StreamFrameSorter {
    fn default() -> Self {
        Self::new()
    }
}
