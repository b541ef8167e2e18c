//! Relay sessions: registry, output pump, SSH-backed remote shells.

pub mod manager;
pub mod ssh;

pub use manager::SessionRegistry;
pub use ssh::SshConnector;
