//! # wasim-client
//!
//! Async Rust client for the WASimCommander server module running inside
//! the simulator.
//!
//! The client talks to the server over a local stream carved into named
//! record channels. On top of that link it runs a session: a handshake,
//! tracked commands with timeouts, variable access, calculator code,
//! subscriptions that push value updates, registered events and key events.
//!
//! ## Architecture
//!
//! - **Link**: framed byte stream with fixed-size records per channel
//!   ([`protocol`], [`codec`], [`transport`])
//! - **Session**: `Connect` handshake, then commands on the Command channel
//!   and `Ack`/`Nak` on the Response channel, correlated by token
//! - **Registries**: data requests and registered events live locally and
//!   are replayed to the server whenever a new session starts
//!
//! ## Example
//!
//! ```ignore
//! use wasim_client::{ClientBuilder, DataRequest, LookupItemType, ValueSize};
//!
//! #[tokio::main]
//! async fn main() -> wasim_client::Result<()> {
//!     let client = ClientBuilder::new(0xC0DE_0001).build()?;
//!     client.set_data_callback(|record| {
//!         println!("request {} = {:?}", record.request_id(), record.value);
//!     });
//!
//!     client.connect(None).await?;
//!     client
//!         .save_data_request(DataRequest::named(1, 'L', "MY_VAR", ValueSize::Float64), true)
//!         .await?;
//!
//!     let locals = client.list(LookupItemType::LocalVariable).await?;
//!     println!("{} local variables", locals.items.len());
//!
//!     client.shutdown().await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod variables;
pub mod writer;

mod callbacks;
mod client;
mod session;
mod tracking;

pub use callbacks::{
    ClientEventCallback, CommandCallback, DataCallback, ListResultsCallback, LogCallback,
};
pub use client::{Client, ClientBuilder};
pub use codec::{Command, DataRequest, DataValue, KeyEvent, LogRecord, ValueSize};
pub use config::ClientConfig;
pub use error::{Result, WasimError};
pub use protocol::{
    CalcResultType, CommandId, LogFacility, LogLevel, LookupItemType, RequestType, UpdatePeriod,
};
pub use session::{ClientEvent, ClientEventType, ClientStatus, ConnectionState, CLIENT_VERSION};
pub use tracking::{DataRequestRecord, ListOutcome, ListResult, RegisteredEvent, SyncStatus};
pub use variables::{CommandValue, VariableRequest};
