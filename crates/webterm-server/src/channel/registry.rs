//! Registry of live browser channels.
//!
//! Each registered channel gets two tasks: an inbound loop that reads frames
//! from the transport and hands them to the [`ChannelEvents`] observer, and an
//! outbound drain that writes queued frames to the transport in FIFO order.
//! The inbound loop is the only place that notices the browser going away.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};
use webterm_core::{DuplexChannel, Message, RelayError, RelayResult};

/// Default outbound queue capacity (frames) per channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Observer of channel lifecycle events.
///
/// Each method is awaited from inside the task that detected the event:
/// `on_connect` from `register`, `on_message` from the inbound loop, and
/// `on_disconnect` from whichever caller performed the removal. Every
/// registration produces exactly one connect and at most one disconnect.
#[async_trait]
pub trait ChannelEvents: Send + Sync {
    async fn on_connect(&self, channel_id: &str);
    async fn on_disconnect(&self, channel_id: &str);
    async fn on_message(&self, channel_id: &str, frame: Vec<u8>);
}

/// One accepted browser transport.
pub struct Channel {
    id: String,
    transport: Arc<dyn DuplexChannel>,
    /// `None` once the channel is closed; never refilled.
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Flipped to `true` on removal to stop the inbound loop.
    shutdown: watch::Sender<bool>,
}

impl Channel {
    /// Build a channel and the receiving end of its outbound queue.
    pub(crate) fn new(
        id: String,
        transport: Arc<dyn DuplexChannel>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let channel = Arc::new(Self {
            id,
            transport,
            outbound: Mutex::new(Some(tx)),
            shutdown: watch::channel(false).0,
        });
        (channel, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the outbound queue has been closed.
    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.outbound().is_none()
    }

    /// Queue a raw frame without waiting.
    ///
    /// A full queue drops the frame and reports [`RelayError::BackpressureExceeded`].
    pub fn enqueue(&self, frame: Vec<u8>) -> RelayResult<()> {
        let outbound = self.outbound();
        let tx = outbound
            .as_ref()
            .ok_or_else(|| RelayError::ChannelClosed(self.id.clone()))?;
        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::BackpressureExceeded(self.id.clone()),
            TrySendError::Closed(_) => RelayError::ChannelClosed(self.id.clone()),
        })
    }

    /// Encode and queue a message.
    pub fn send_message(&self, message: &Message) -> RelayResult<()> {
        let frame = message.encode()?;
        self.enqueue(frame)
    }

    /// Close the outbound queue and stop the inbound loop. Frames already
    /// queued are still flushed by the drain, which then closes the transport.
    fn close(&self) {
        self.outbound().take();
        self.shutdown.send_replace(true);
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::Sender<Vec<u8>>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns every live channel, keyed by channel id.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    events: OnceLock<Weak<dyn ChannelEvents>>,
    queue_capacity: usize,
}

impl ChannelRegistry {
    /// Create an empty registry whose channels queue up to `queue_capacity` frames.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            events: OnceLock::new(),
            queue_capacity,
        }
    }

    /// Install the lifecycle observer. Only the first call takes effect.
    ///
    /// Held weakly: the observer usually owns a handle back to this registry.
    pub fn set_events(&self, events: Weak<dyn ChannelEvents>) {
        if self.events.set(events).is_err() {
            warn!("channel event observer already installed, ignoring");
        }
    }

    fn events(&self) -> Option<Arc<dyn ChannelEvents>> {
        self.events.get().and_then(Weak::upgrade)
    }

    /// Register a transport under `id` and start its inbound and outbound tasks.
    pub async fn register(
        self: &Arc<Self>,
        id: String,
        transport: Arc<dyn DuplexChannel>,
    ) -> RelayResult<Arc<Channel>> {
        let (channel, outbound_rx) = Channel::new(id.clone(), transport, self.queue_capacity);
        {
            let mut channels = self.channels.write().await;
            if channels.contains_key(&id) {
                return Err(RelayError::DuplicateId(id));
            }
            channels.insert(id.clone(), channel.clone());
        }
        info!(channel_id = %id, "channel registered");

        if let Some(events) = self.events() {
            events.on_connect(&id).await;
        }

        tokio::spawn(drain_outbound(
            Arc::downgrade(self),
            channel.clone(),
            outbound_rx,
        ));

        let registry = Arc::clone(self);
        let inbound = channel.clone();
        tokio::spawn(async move {
            registry.read_inbound(inbound).await;
        });

        Ok(channel)
    }

    /// Remove the channel registered under `id`.
    ///
    /// Returns `false` (and does nothing) if no such channel is live.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.channels.write().await.remove(id);
        match removed {
            Some(channel) => {
                self.finish_removal(channel).await;
                true
            }
            None => false,
        }
    }

    /// Remove `channel` only if it is still the one registered under its id,
    /// so a stale loop cannot evict a newer channel that reused the id.
    async fn remove_channel(&self, channel: &Arc<Channel>) -> bool {
        let removed = {
            let mut channels = self.channels.write().await;
            match channels.get(channel.id()) {
                Some(current) if Arc::ptr_eq(current, channel) => channels.remove(channel.id()),
                _ => None,
            }
        };
        match removed {
            Some(channel) => {
                self.finish_removal(channel).await;
                true
            }
            None => false,
        }
    }

    async fn finish_removal(&self, channel: Arc<Channel>) {
        channel.close();
        info!(channel_id = %channel.id(), "channel removed");
        if let Some(events) = self.events() {
            events.on_disconnect(channel.id()).await;
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.read().await.get(id).cloned()
    }

    /// Queue `message` for the channel registered under `id`.
    ///
    /// Fails with [`RelayError::ChannelClosed`] if the channel is gone and
    /// [`RelayError::BackpressureExceeded`] if its queue is full. Never waits
    /// on the queue.
    pub async fn send(&self, id: &str, message: &Message) -> RelayResult<()> {
        let channel = self
            .get(id)
            .await
            .ok_or_else(|| RelayError::ChannelClosed(id.to_string()))?;
        channel.send_message(message)
    }

    /// Best-effort delivery to every live channel. Channels whose queue is
    /// full or closed are skipped. Returns how many channels accepted it.
    pub async fn broadcast(&self, message: &Message) -> usize {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode broadcast message");
                return 0;
            }
        };

        let channels = self.channels.read().await;
        let mut delivered = 0;
        for channel in channels.values() {
            match channel.enqueue(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(channel_id = %channel.id(), error = %e, "broadcast skipped"),
            }
        }
        delivered
    }

    /// Ids of all live channels.
    pub async fn ids(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Inbound loop: one frame at a time until the transport closes, fails,
    /// or the channel is removed elsewhere.
    async fn read_inbound(self: Arc<Self>, channel: Arc<Channel>) {
        let mut shutdown = channel.shutdown.subscribe();
        loop {
            let received = tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => break,
                received = channel.transport.receive_frame() => received,
            };
            match received {
                Ok(Some(frame)) => {
                    if let Some(events) = self.events() {
                        events.on_message(channel.id(), frame).await;
                    }
                }
                Ok(None) => {
                    debug!(channel_id = %channel.id(), "channel closed by peer");
                    break;
                }
                Err(e) => {
                    debug!(channel_id = %channel.id(), error = %e, "channel read failed");
                    break;
                }
            }
        }
        self.remove_channel(&channel).await;
    }
}

/// Outbound drain: write queued frames in order; once the queue is closed and
/// empty, send the close frame. A failed write removes the channel and closes
/// the transport without writing anything further.
async fn drain_outbound(
    registry: Weak<ChannelRegistry>,
    channel: Arc<Channel>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(e) = channel.transport.send_frame(frame).await {
            warn!(channel_id = %channel.id(), error = %e, "channel write failed");
            outbound_rx.close();
            if let Some(registry) = registry.upgrade() {
                registry.remove_channel(&channel).await;
            }
            break;
        }
    }
    if let Err(e) = channel.transport.close().await {
        debug!(channel_id = %channel.id(), error = %e, "channel close failed");
    }
}
