//! webterm-core: Shared contracts for the webterm relay gateway.
//!
//! Provides the relay error taxonomy, the JSON terminal message codec, and
//! the abstract capabilities the relay engine is built against: a duplex
//! frame channel (browser side) and a remote interactive shell.

pub mod error;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use error::{RelayError, RelayResult};
pub use messages::{Message, MsgType};
pub use transport::{DuplexChannel, RemoteShell, ShellConnector, ShellTarget};
