//! Abstract capabilities the relay is built against.
//!
//! The browser-facing transport and the remote shell are both consumed
//! through these traits, so the registries never depend on WebSocket or SSH
//! types directly.

use crate::error::RelayResult;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// A full-duplex, message-framed channel to a browser.
///
/// Sending and receiving may happen concurrently from different tasks.
#[async_trait]
pub trait DuplexChannel: Send + Sync {
    /// Write one frame.
    async fn send_frame(&self, frame: Vec<u8>) -> RelayResult<()>;

    /// Receive the next frame. `None` means the peer closed the channel.
    async fn receive_frame(&self) -> RelayResult<Option<Vec<u8>>>;

    /// Send a protocol-level close frame and shut the write side down.
    async fn close(&self) -> RelayResult<()>;
}

/// An interactive shell running on a remote host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Write bytes to the shell's input.
    async fn write(&self, data: &[u8]) -> RelayResult<()>;

    /// Read the next chunk of output. `None` means end of stream.
    ///
    /// Must return `None` promptly once [`RemoteShell::close`] has run.
    async fn read_chunk(&self) -> RelayResult<Option<Vec<u8>>>;

    /// Change the pseudo-terminal size.
    async fn resize(&self, cols: u32, rows: u32) -> RelayResult<()>;

    /// Tear the shell down.
    async fn close(&self) -> RelayResult<()>;
}

/// Dials remote hosts and opens interactive shells on them.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(&self, target: &ShellTarget) -> RelayResult<Arc<dyn RemoteShell>>;
}

/// Where and as whom to open a remote shell.
#[derive(Clone)]
pub struct ShellTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: String,
}

impl ShellTarget {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            credential: credential.into(),
        }
    }

    /// `host:port` for logging and dialing.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ShellTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("credential", &"<redacted>")
            .finish()
    }
}
