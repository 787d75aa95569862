//! Log record forwarded by the server.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{check_record_len, get_fixed_str, put_fixed_str, STRSZ_LOG};
use crate::error::Result;
use crate::protocol::LogLevel;

/// Encoded size of a [`LogRecord`].
pub const LOG_RECORD_SIZE: usize = 8 + 1 + STRSZ_LOG;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogRecord {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>, timestamp: u64) -> Self {
        Self {
            timestamp,
            level,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(LOG_RECORD_SIZE);
        buf.put_u64_le(self.timestamp);
        buf.put_u8(self.level.as_u8());
        put_fixed_str(&mut buf, &self.message, STRSZ_LOG);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        check_record_len("LogRecord", payload, LOG_RECORD_SIZE)?;
        let mut buf = payload;
        let timestamp = buf.get_u64_le();
        let level = LogLevel::try_from(buf.get_u8())?;
        let message = get_fixed_str(&mut buf, STRSZ_LOG);
        Ok(Self {
            timestamp,
            level,
            message,
        })
    }
}
