//! Client configuration.
//!
//! [`ClientConfig`] carries every tunable the session engine reads. It can be
//! filled in through [`ClientBuilder`](crate::ClientBuilder) setters or
//! deserialized from whatever startup source the application uses; durations
//! are plain milliseconds in serialized form.
//!
//! ```
//! use wasim_client::ClientConfig;
//!
//! let config = ClientConfig::from_json_str(r#"{ "default_timeout": 2500 }"#).unwrap();
//! assert_eq!(config.default_timeout.as_millis(), 2500);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::{LogFacility, LogLevel, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::transport::PipeConnector;
use crate::writer::WriterConfig;

/// Default timeout for anything that waits on the server.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Largest value a single data request may declare.
pub const DEFAULT_MAX_VALUE_SIZE: u32 = 8192;

/// Cap on the summed value capacity of all data requests.
pub const DEFAULT_MAX_TOTAL_DATA: u64 = 1024 * 1024;

/// How long one dispatch read waits before re-checking for shutdown.
pub const DEFAULT_DISPATCH_WAIT: Duration = Duration::from_millis(25);

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout used when an operation is not given one.
    #[serde(with = "millis")]
    pub default_timeout: Duration,
    /// Log level requested from the server at each session start.
    pub server_log_level: LogLevel,
    /// Where the server should send its log output.
    pub server_log_facility: LogFacility,
    /// Maximum value size of a single data request, in bytes.
    pub max_value_size: u32,
    /// Maximum summed value capacity of all data requests, in bytes.
    pub max_total_data: u64,
    /// Bounded wait of the dispatch loop.
    #[serde(with = "millis")]
    pub dispatch_wait: Duration,
    /// Largest inbound frame payload accepted.
    pub max_payload_size: u32,
    /// Path used by the default pipe connector.
    pub pipe_path: String,
    /// Outbound writer tuning.
    pub writer: WriterConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            server_log_level: LogLevel::Info,
            server_log_facility: LogFacility::REMOTE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            max_total_data: DEFAULT_MAX_TOTAL_DATA,
            dispatch_wait: DEFAULT_DISPATCH_WAIT,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            pipe_path: PipeConnector::default_path(),
            writer: WriterConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse from JSON; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
