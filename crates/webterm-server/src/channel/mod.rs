//! Browser-facing channels: registry, outbound queues, lifecycle events.

pub mod registry;

pub use registry::{ChannelEvents, ChannelRegistry, DEFAULT_QUEUE_CAPACITY};
