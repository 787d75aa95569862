//! Transport module - how the client reaches the server.
//!
//! [`Connector`] is the seam the session engine depends on. The shipped
//! implementation, [`PipeConnector`], uses:
//! - Unix Domain Sockets (Linux/macOS)
//! - Named Pipes (Windows)

mod connector;
mod pipe;

pub use connector::{BoxFuture, BoxedReader, BoxedWriter, Connector, TransportStream};
pub use pipe::PipeConnector;
