//! Key event record.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::check_record_len;
use crate::error::Result;

/// Encoded size of a [`KeyEvent`].
pub const KEY_EVENT_SIZE: usize = 4 + 5 * 4 + 4 + 4;

/// A simulator key event with up to five arguments.
///
/// The server answers with an `Ack`/`Nak` carrying `token`, but the client
/// does not wait for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyEvent {
    pub event_id: u32,
    pub values: [u32; 5],
    pub token: u32,
}

impl KeyEvent {
    pub fn new(event_id: u32, values: [u32; 5], token: u32) -> Self {
        Self {
            event_id,
            values,
            token,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(KEY_EVENT_SIZE);
        buf.put_u32_le(self.event_id);
        for v in self.values {
            buf.put_u32_le(v);
        }
        buf.put_u32_le(self.token);
        // reserved
        buf.put_u32_le(0);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        check_record_len("KeyEvent", payload, KEY_EVENT_SIZE)?;
        let mut buf = payload;
        let event_id = buf.get_u32_le();
        let mut values = [0u32; 5];
        for v in values.iter_mut() {
            *v = buf.get_u32_le();
        }
        let token = buf.get_u32_le();
        Ok(Self {
            event_id,
            values,
            token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_event_layout() {
        let ev = KeyEvent::new(65752, [1, 2, 3, 4, 5], 99);
        let bytes = ev.encode();

        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..4], &65752u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &5u32.to_le_bytes());
        assert_eq!(&bytes[24..28], &99u32.to_le_bytes());
        assert_eq!(&bytes[28..32], &[0, 0, 0, 0]);
        assert_eq!(KeyEvent::decode(&bytes).unwrap(), ev);
    }
}
