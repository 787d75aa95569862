//! Codec module - fixed-layout records exchanged with the server.
//!
//! Every record is a packed, little-endian struct of constant size:
//!
//! - [`Command`] (544 bytes) on the Command and Response channels
//! - [`DataRequest`] (1088 bytes) on the Request channel
//! - [`KeyEvent`] (32 bytes) on the KeyEvent channel
//! - [`LogRecord`] (1040 bytes) on the Log channel
//!
//! Value updates are raw bytes of the request's declared size; they are
//! decoded into a [`DataValue`] and never handed out raw.
//!
//! # Design
//!
//! Records are plain structs with `encode`/`decode` methods, the same way
//! the frame header is handled. Strings are fixed `char[N]` arrays on the
//! wire: NUL padded, at most `N - 1` bytes of text.
//!
//! # Example
//!
//! ```
//! use wasim_client::codec::{Command, COMMAND_SIZE};
//! use wasim_client::protocol::CommandId;
//!
//! let cmd = Command::with_text(CommandId::Exec, 1, "(A:PLANE ALTITUDE,feet)").token(7);
//! let bytes = cmd.encode();
//! assert_eq!(bytes.len(), COMMAND_SIZE);
//! assert_eq!(Command::decode(&bytes).unwrap(), cmd);
//! ```

mod command;
mod data_request;
mod key_event;
mod log_record;
mod value;

use bytes::{BufMut, BytesMut};

use crate::error::{Result, WasimError};

pub use command::{Command, COMMAND_SIZE};
pub use data_request::{DataRequest, DATA_REQUEST_SIZE};
pub use key_event::{KeyEvent, KEY_EVENT_SIZE};
pub use log_record::{LogRecord, LOG_RECORD_SIZE};
pub use value::{
    DataValue, ValueSize, DATA_TYPE_DOUBLE, DATA_TYPE_FLOAT, DATA_TYPE_INT16, DATA_TYPE_INT32,
    DATA_TYPE_INT64, DATA_TYPE_INT8,
};

/// Size of the `s_data` text field of a command, including the terminator.
pub const STRSZ_CMD: usize = 527;
/// Size of the name/code field of a data request.
pub const STRSZ_REQ: usize = 1030;
/// Size of the unit name field of a data request.
pub const STRSZ_UNIT: usize = 37;
/// Size of the message field of a log record.
pub const STRSZ_LOG: usize = 1031;
/// Maximum length of a registered event name.
pub const STRSZ_ENAME: usize = 64;

/// Write `s` as a NUL-padded `char[size]`, truncating on a char boundary.
pub(crate) fn put_fixed_str(buf: &mut BytesMut, s: &str, size: usize) {
    let max = size.saturating_sub(1);
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_slice(&s.as_bytes()[..end]);
    buf.put_bytes(0, size - end);
}

/// Read a NUL-terminated `char[size]` and advance the cursor.
pub(crate) fn get_fixed_str(buf: &mut &[u8], size: usize) -> String {
    let (raw, rest) = buf.split_at(size.min(buf.len()));
    *buf = rest;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Reject a payload whose length is not exactly one record.
pub(crate) fn check_record_len(what: &str, payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(WasimError::Protocol(format!(
            "{} record is {} bytes, expected {}",
            what,
            payload.len(),
            expected
        )));
    }
    Ok(())
}
