//! Protocol module - framing and wire enumerations.
//!
//! This module implements the stream framing that carries the named record
//! channels:
//! - 14-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors
//! - Single-byte enums carried inside records

mod enums;
mod frame;
mod frame_buffer;
mod wire_format;

pub use enums::{
    CalcResultType, CommandId, LogFacility, LogLevel, LookupItemType, RequestType, UpdatePeriod,
};
pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    channel_name, flags, Channel, Header, CHANNEL_NAME_PREFIX, DEFAULT_MAX_PAYLOAD_SIZE,
    HEADER_SIZE,
};
