//! Reassembly of frames from arbitrary read boundaries.
//!
//! The link is a byte stream, so one read may hold several frames or a
//! fraction of one. Bytes accumulate in a single `BytesMut`; once a header
//! is complete and valid it is consumed and kept aside until its payload
//! has arrived.

use bytes::{Buf, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::{Result, WasimError};

/// Incremental frame decoder for one link.
pub struct FrameBuffer {
    buffer: BytesMut,
    /// Header already consumed, waiting for its payload.
    pending: Option<Header>,
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Decoder with the default 64 KB payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            pending: None,
            max_payload_size,
        }
    }

    /// Append `data` and return every frame it completes, in stream order.
    ///
    /// # Errors
    ///
    /// A header that fails validation (unknown channel, reserved flags,
    /// oversized payload, control frame with the wrong payload length) is a
    /// protocol error. The stream cannot be resynchronized after that, so
    /// callers should drop the link.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                let Some(header) = Header::decode(&self.buffer) else {
                    return Ok(None);
                };
                header.validate(self.max_payload_size)?;
                check_control_payload(&header)?;
                self.buffer.advance(HEADER_SIZE);
                self.pending = Some(header);
                header
            }
        };

        let len = header.payload_length as usize;
        if self.buffer.len() < len {
            return Ok(None);
        }
        self.pending = None;
        let payload = self.buffer.split_to(len).freeze();
        Ok(Some(Frame::new(header, payload)))
    }

    /// True when no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_none() && self.buffer.is_empty()
    }

    #[cfg(test)]
    fn awaiting_payload(&self) -> bool {
        self.pending.is_some()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// OPEN carries the channel's record size (a `u32`); CLOSE and QUIT carry
/// nothing.
fn check_control_payload(header: &Header) -> Result<()> {
    let expected = if header.is_open() {
        4
    } else if header.is_close() || header.is_quit() {
        0
    } else {
        return Ok(());
    };
    if header.payload_length != expected {
        return Err(WasimError::Protocol(format!(
            "control frame on channel {} has {} payload bytes, expected {}",
            header.channel, header.payload_length, expected
        )));
    }
    Ok(())
}
