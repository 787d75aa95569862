//! Platform-specific pipe/socket connector.
//!
//! - Unix: Unix Domain Socket
//! - Windows: Named Pipe
//!
//! # Example
//!
//! ```ignore
//! use wasim_client::transport::{Connector, PipeConnector};
//!
//! let connector = PipeConnector::new(PipeConnector::default_path());
//! let stream = connector.connect().await?;
//! ```

use super::connector::{BoxFuture, Connector, TransportStream};
use crate::error::Result;

/// Connects to the server's local pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeConnector {
    path: String,
}

impl PipeConnector {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Well-known path the server listens on.
    ///
    /// Format:
    /// - Unix: `/tmp/wasimcommander.sock`
    /// - Windows: `\\.\pipe\WASimCommander`
    pub fn default_path() -> String {
        #[cfg(unix)]
        {
            "/tmp/wasimcommander.sock".to_string()
        }

        #[cfg(windows)]
        {
            r"\\.\pipe\WASimCommander".to_string()
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Default for PipeConnector {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
async fn open(path: &str) -> Result<TransportStream> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    let (reader, writer) = stream.into_split();
    Ok(TransportStream::new(reader, writer))
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
async fn open(path: &str) -> Result<TransportStream> {
    use std::time::Duration;
    use tokio::net::windows::named_pipe::ClientOptions;

    // ERROR_PIPE_BUSY: every server instance is taken, wait for the next one.
    const ERROR_PIPE_BUSY: i32 = 231;

    let pipe = loop {
        match ClientOptions::new().open(path) {
            Ok(pipe) => break pipe,
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(e) => return Err(e.into()),
        }
    };
    let (reader, writer) = tokio::io::split(pipe);
    Ok(TransportStream::new(reader, writer))
}

impl Connector for PipeConnector {
    fn connect(&self) -> BoxFuture<'_, Result<TransportStream>> {
        Box::pin(open(&self.path))
    }

    fn describe(&self) -> String {
        format!("pipe {}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_path_format() {
        let path = PipeConnector::default_path();

        #[cfg(unix)]
        assert!(path.ends_with(".sock"));

        #[cfg(windows)]
        assert!(path.starts_with(r"\\.\pipe\"));

        assert_eq!(PipeConnector::default().path(), path);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_to_unix_socket() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let path = std::env::temp_dir().join(format!("wasim-test-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let connector = PipeConnector::new(path.to_string_lossy());
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let mut stream = connector.connect().await.unwrap();
        let mut server = accept.await.unwrap();

        stream.writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let _ = std::fs::remove_file(&path);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_missing_socket_fails() {
        let connector = PipeConnector::new("/nonexistent/dir/wasim.sock");
        assert!(connector.connect().await.is_err());
    }
}
