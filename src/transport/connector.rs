//! The seam between the session engine and the byte stream it runs over.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Boxed future returned by [`Connector::connect`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Read half of a link.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a link.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both halves of an established link.
pub struct TransportStream {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl TransportStream {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Opens the link to the server.
///
/// Called once per link establishment; a reconnect after a link loss calls
/// it again. Implementations should not retry internally, since the caller
/// bounds the whole attempt with its own timeout.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<TransportStream>>;

    /// Short description for log messages.
    fn describe(&self) -> String {
        "custom connector".to_string()
    }
}
