//! Command record.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{check_record_len, get_fixed_str, put_fixed_str, STRSZ_CMD};
use crate::error::{Result, WasimError};
use crate::protocol::CommandId;

/// Encoded size of a [`Command`]: token, u_data, f_data, command id, text.
pub const COMMAND_SIZE: usize = 4 + 4 + 8 + 1 + STRSZ_CMD;

/// A command sent to the server, or a response received from it.
///
/// Responses are `Ack`/`Nak` commands that echo the token of the command they
/// answer and carry its kind in `u_data`. A `Nak` may explain itself in
/// `s_data`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Command {
    /// Correlation token, 0 = not tracked.
    pub token: u32,
    pub u_data: u32,
    pub f_data: f64,
    pub command_id: CommandId,
    pub s_data: String,
}

impl Command {
    /// Create a command with no text.
    pub fn new(command_id: CommandId, u_data: u32) -> Self {
        Self {
            command_id,
            u_data,
            ..Default::default()
        }
    }

    /// Create a command carrying a text argument.
    pub fn with_text(command_id: CommandId, u_data: u32, s_data: impl Into<String>) -> Self {
        Self {
            command_id,
            u_data,
            s_data: s_data.into(),
            ..Default::default()
        }
    }

    /// Set the correlation token.
    pub fn token(mut self, token: u32) -> Self {
        self.token = token;
        self
    }

    /// Set the floating point argument.
    pub fn f_data(mut self, value: f64) -> Self {
        self.f_data = value;
        self
    }

    /// Build an `Ack` for `command`.
    pub fn ack_for(command: &Command) -> Self {
        Self::new(CommandId::Ack, command.command_id.into()).token(command.token)
    }

    /// Build a `Nak` for `command` with a reason.
    pub fn nak_for(command: &Command, reason: impl Into<String>) -> Self {
        Self::with_text(CommandId::Nak, command.command_id.into(), reason).token(command.token)
    }

    #[inline]
    pub fn is_ack(&self) -> bool {
        self.command_id == CommandId::Ack
    }

    #[inline]
    pub fn is_nak(&self) -> bool {
        self.command_id == CommandId::Nak
    }

    /// For an `Ack`/`Nak`, the kind of command being answered.
    pub fn responds_to(&self) -> Option<CommandId> {
        if self.is_ack() || self.is_nak() {
            CommandId::try_from(self.u_data).ok()
        } else {
            None
        }
    }

    /// Turn a `Nak` response into [`WasimError::Rejected`].
    pub fn into_result(self) -> Result<Command> {
        if self.is_nak() {
            return Err(WasimError::Rejected {
                command: self.responds_to().unwrap_or_default(),
                reason: self.s_data,
            });
        }
        Ok(self)
    }

    /// Encode to the fixed wire layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COMMAND_SIZE);
        buf.put_u32_le(self.token);
        buf.put_u32_le(self.u_data);
        buf.put_f64_le(self.f_data);
        buf.put_u8(self.command_id.as_u8());
        put_fixed_str(&mut buf, &self.s_data, STRSZ_CMD);
        buf.freeze()
    }

    /// Decode from the fixed wire layout.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        check_record_len("Command", payload, COMMAND_SIZE)?;
        let mut buf = payload;
        let token = buf.get_u32_le();
        let u_data = buf.get_u32_le();
        let f_data = buf.get_f64_le();
        let command_id = CommandId::try_from(buf.get_u8())?;
        let s_data = get_fixed_str(&mut buf, STRSZ_CMD);
        Ok(Self {
            token,
            u_data,
            f_data,
            command_id,
            s_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_size() {
        assert_eq!(COMMAND_SIZE, 544);
        assert_eq!(Command::default().encode().len(), COMMAND_SIZE);
    }

    #[test]
    fn test_command_layout() {
        let cmd = Command::with_text(CommandId::Get, b'L' as u32, "MY_VAR")
            .token(0x0102_0304)
            .f_data(2.5);
        let bytes = cmd.encode();

        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &(b'L' as u32).to_le_bytes());
        assert_eq!(&bytes[8..16], &2.5f64.to_le_bytes());
        assert_eq!(bytes[16], CommandId::Get.as_u8());
        assert_eq!(&bytes[17..23], b"MY_VAR");
        assert_eq!(bytes[23], 0);
        assert_eq!(Command::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_decode_rejects_unknown_command_id() {
        let mut raw = Command::new(CommandId::Ping, 0).encode().to_vec();
        raw[16] = 250;
        assert!(Command::decode(&raw).is_err());
    }

    #[test]
    fn test_ack_nak_helpers() {
        let cmd = Command::new(CommandId::Lookup, 5).token(9);

        let ack = Command::ack_for(&cmd);
        assert!(ack.is_ack());
        assert_eq!(ack.token, 9);
        assert_eq!(ack.responds_to(), Some(CommandId::Lookup));
        assert!(ack.into_result().is_ok());

        let nak = Command::nak_for(&cmd, "no such thing");
        match nak.into_result() {
            Err(WasimError::Rejected { command, reason }) => {
                assert_eq!(command, CommandId::Lookup);
                assert_eq!(reason, "no such thing");
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_responds_to_only_for_responses() {
        assert_eq!(Command::new(CommandId::Get, 1).responds_to(), None);
    }
}
