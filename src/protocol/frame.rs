//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use wasim_client::protocol::{Channel, Frame, Header};
//! use bytes::Bytes;
//!
//! let header = Header::record(Channel::Value, 1, 42, 8);
//! let frame = Frame::new(header, Bytes::copy_from_slice(&1.5f64.to_le_bytes()));
//!
//! assert_eq!(frame.channel(), Some(Channel::Value));
//! assert_eq!(frame.key(), 42);
//! ```

use bytes::Bytes;

use super::wire_format::{Channel, Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Decoded channel, `None` for an unknown channel byte.
    #[inline]
    pub fn channel(&self) -> Option<Channel> {
        self.header.channel()
    }

    #[inline]
    pub fn client_id(&self) -> u32 {
        self.header.client_id
    }

    #[inline]
    pub fn key(&self) -> u32 {
        self.header.key
    }

    /// Check if this is the peer's shutdown notice.
    #[inline]
    pub fn is_quit(&self) -> bool {
        self.header.is_quit()
    }
}

/// Build a complete frame as a single byte vector.
///
/// Encodes header and appends payload into a contiguous buffer.
/// The writer task uses vectored writes instead; this is for peers and tests.
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
