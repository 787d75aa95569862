//! Enumerations carried inside wire records.
//!
//! All of them are a single byte on the wire. Decoding an unknown value is a
//! protocol error rather than a silent fallback.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WasimError};

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            /// Wire value of this variant.
            #[inline]
            pub fn as_u8(self) -> u8 {
                self as u8
            }
        }

        impl From<$name> for u32 {
            fn from(value: $name) -> u32 {
                value as u32
            }
        }

        impl TryFrom<u8> for $name {
            type Error = WasimError;

            fn try_from(value: u8) -> Result<Self> {
                match value {
                    $( v if v == $value => Ok($name::$variant), )+
                    other => Err(WasimError::Protocol(format!(
                        "Invalid {} value {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl TryFrom<u32> for $name {
            type Error = WasimError;

            fn try_from(value: u32) -> Result<Self> {
                u8::try_from(value)
                    .map_err(|_| WasimError::Protocol(format!(
                        "Invalid {} value {}",
                        stringify!($name),
                        value
                    )))
                    .and_then(<$name as TryFrom<u8>>::try_from)
            }
        }
    };
}

wire_enum! {
    /// Command kinds understood by the server.
    ///
    /// `Ack`/`Nak` responses carry the kind of the command they answer in
    /// `u_data`.
    pub enum CommandId {
        #[default]
        None = 0,
        Ack = 1,
        Nak = 2,
        Ping = 3,
        Connect = 4,
        Disconnect = 5,
        List = 6,
        Lookup = 7,
        Get = 8,
        GetCreate = 9,
        Set = 10,
        SetCreate = 11,
        Exec = 12,
        Register = 13,
        Transmit = 14,
        Subscribe = 15,
        Update = 16,
        SendKey = 17,
        Log = 18,
    }
}

wire_enum! {
    /// What a data request targets.
    pub enum RequestType {
        /// Removes the request on the server.
        #[default]
        None = 0,
        /// A named variable (`A`, `L`, `T`, ... prefix).
        Named = 1,
        /// Calculator code evaluated on every update.
        Calculated = 2,
    }
}

wire_enum! {
    /// Result kind for calculator code.
    pub enum CalcResultType {
        #[default]
        None = 0,
        Double = 1,
        Integer = 2,
        String = 3,
        Formatted = 4,
    }
}

wire_enum! {
    /// How often the server re-evaluates a data request.
    pub enum UpdatePeriod {
        Never = 0,
        Once = 1,
        #[default]
        Tick = 2,
        Millisecond = 3,
    }
}

wire_enum! {
    /// Item categories for `Lookup` and `List`.
    pub enum LookupItemType {
        #[default]
        None = 0,
        LocalVariable = 1,
        SimulatorVariable = 2,
        TokenVariable = 3,
        UnitType = 4,
        KeyEventId = 5,
        DataRequest = 6,
        RegisteredEvent = 7,
    }
}

wire_enum! {
    /// Log severity, as sent by the server and used for the remote log level.
    pub enum LogLevel {
        None = 0,
        Critical = 1,
        Error = 2,
        Warning = 3,
        #[default]
        Info = 4,
        Debug = 5,
        Trace = 6,
    }
}

/// Server-side log destinations, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogFacility(pub u8);

impl LogFacility {
    pub const NONE: LogFacility = LogFacility(0);
    pub const CONSOLE: LogFacility = LogFacility(0x01);
    pub const FILE: LogFacility = LogFacility(0x02);
    pub const REMOTE: LogFacility = LogFacility(0x04);
    pub const ALL: LogFacility = LogFacility(0x07);

    /// Check whether every bit of `other` is set.
    #[inline]
    pub fn contains(self, other: LogFacility) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl std::ops::BitOr for LogFacility {
    type Output = LogFacility;

    fn bitor(self, rhs: Self) -> Self::Output {
        LogFacility(self.0 | rhs.0)
    }
}
