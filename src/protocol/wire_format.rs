//! Wire format encoding and decoding.
//!
//! Every record travels inside a frame with a 14-byte header:
//! ```text
//! ┌─────────┬───────┬───────────┬──────────┬──────────┐
//! │ Channel │ Flags │ Client ID │ Key      │ Length   │
//! │ 1 byte  │ 1 byte│ uint32 LE │ uint32 LE│ uint32 LE│
//! └─────────┴───────┴───────────┴──────────┴──────────┘
//! ```
//!
//! The channel byte selects one of the named record channels, `key` selects
//! a sub-channel (the request id for value channels), and the client id
//! namespaces channels so one server can serve many clients. All multi-byte
//! integers are Little Endian, matching the packed records they carry.

use std::fmt;

use crate::error::{Result, WasimError};

/// Header size in bytes (fixed, exactly 14).
pub const HEADER_SIZE: usize = 14;

/// Default maximum payload size (64 KB). The largest record is 1088 bytes.
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024;

/// Prefix used for human-readable channel names.
pub const CHANNEL_NAME_PREFIX: &str = "WASimCommander";

/// Named record channels multiplexed over the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Link control: channel open/close, shutdown notice.
    Link = 0,
    /// Client → server commands.
    Command = 1,
    /// Server → client command responses.
    Response = 2,
    /// Client → server data request descriptors.
    Request = 3,
    /// Server → client value updates, one sub-channel per request id.
    Value = 4,
    /// Client → server key events.
    KeyEvent = 5,
    /// Server → client log records.
    Log = 6,
}

impl Channel {
    /// Decode a channel byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Channel::Link,
            1 => Channel::Command,
            2 => Channel::Response,
            3 => Channel::Request,
            4 => Channel::Value,
            5 => Channel::KeyEvent,
            6 => Channel::Log,
            _ => return None,
        })
    }

    /// Short name used inside channel names.
    pub fn label(self) -> &'static str {
        match self {
            Channel::Link => "Link",
            Channel::Command => "Command",
            Channel::Response => "Response",
            Channel::Request => "Request",
            Channel::Value => "Data",
            Channel::KeyEvent => "KeyEvent",
            Channel::Log => "Log",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Build the per-client name of a channel, e.g. `WASimCommander.Command.C0DE0001`.
///
/// Value channels include the request id: `WASimCommander.Data.C0DE0001.7`.
pub fn channel_name(channel: Channel, client_id: u32, key: u32) -> String {
    match channel {
        Channel::Value => format!(
            "{}.{}.{:08X}.{}",
            CHANNEL_NAME_PREFIX,
            channel.label(),
            client_id,
            key
        ),
        _ => format!("{}.{}.{:08X}", CHANNEL_NAME_PREFIX, channel.label(), client_id),
    }
}

/// Flag constants for the protocol.
pub mod flags {
    /// Open the channel named by (channel, key); payload is the record size.
    pub const OPEN: u8 = 0b0000_0001;
    /// Close the channel named by (channel, key).
    pub const CLOSE: u8 = 0b0000_0010;
    /// Peer is shutting down the link (only valid on the Link channel).
    pub const QUIT: u8 = 0b0000_0100;

    /// Reserved bits mask (bits 3-7).
    pub const RESERVED_MASK: u8 = 0b1111_1000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw channel byte (see [`Channel`]).
    pub channel: u8,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Owning client.
    pub client_id: u32,
    /// Sub-channel key (request id for values, 0 otherwise).
    pub key: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(channel: Channel, flags: u8, client_id: u32, key: u32, payload_length: u32) -> Self {
        Self {
            channel: channel as u8,
            flags,
            client_id,
            key,
            payload_length,
        }
    }

    /// Header for a plain record write.
    pub fn record(channel: Channel, client_id: u32, key: u32, payload_length: u32) -> Self {
        Self::new(channel, 0, client_id, key, payload_length)
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use wasim_client::protocol::{Channel, Header};
    ///
    /// let header = Header::record(Channel::Command, 0xC0DE0001, 0, 544);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 14);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (14 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.channel;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.client_id.to_le_bytes());
        buf[6..10].copy_from_slice(&self.key.to_le_bytes());
        buf[10..14].copy_from_slice(&self.payload_length.to_le_bytes());
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            channel: buf[0],
            flags: buf[1],
            client_id: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
            key: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            payload_length: u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Channel byte is known
    /// - Payload length doesn't exceed max
    /// - Reserved flag bits are 0
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if Channel::from_u8(self.channel).is_none() {
            return Err(WasimError::Protocol(format!(
                "Unknown channel {}",
                self.channel
            )));
        }

        if self.payload_length > max_payload_size {
            return Err(WasimError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(WasimError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Decoded channel, if known.
    #[inline]
    pub fn channel(&self) -> Option<Channel> {
        Channel::from_u8(self.channel)
    }

    /// Check if this is a channel-open control frame.
    #[inline]
    pub fn is_open(&self) -> bool {
        flags::has_flag(self.flags, flags::OPEN)
    }

    /// Check if this is a channel-close control frame.
    #[inline]
    pub fn is_close(&self) -> bool {
        flags::has_flag(self.flags, flags::CLOSE)
    }

    /// Check if this is the peer's shutdown notice.
    #[inline]
    pub fn is_quit(&self) -> bool {
        self.channel == Channel::Link as u8 && flags::has_flag(self.flags, flags::QUIT)
    }

    /// Check if this frame carries a record (no control flags).
    #[inline]
    pub fn is_record(&self) -> bool {
        self.flags == 0
    }
}
