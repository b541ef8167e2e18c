//! Relay session lifecycle management.
//!
//! A relay session binds one remote shell to one browser channel; the
//! session id is always the id of the channel it is bound to. Every way a
//! session can end (shell EOF or error, browser disconnect, explicit close)
//! converges on a single teardown: remove from the map, fire the cancel
//! signal, close the shell. Whoever wins the map removal runs it.

use crate::channel::{ChannelEvents, ChannelRegistry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use webterm_core::{Message, RelayError, RelayResult, RemoteShell, ShellConnector, ShellTarget};

/// Terminal size requested when the shell is opened (cols, rows).
pub const INITIAL_DIMENSIONS: (u32, u32) = (80, 40);

/// One remote shell bound to one channel.
pub struct RelaySession {
    /// Equal to the bound channel's id.
    id: String,
    /// `host:port` of the remote end.
    remote: String,
    user: String,
    shell: Arc<dyn RemoteShell>,
    /// Single-fire cancellation for the output pump.
    cancel: watch::Sender<bool>,
    dimensions: Mutex<(u32, u32)>,
    created_at: Instant,
}

impl RelaySession {
    fn new(id: String, target: &ShellTarget, shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            id,
            remote: target.addr(),
            user: target.user.clone(),
            shell,
            cancel: watch::channel(false).0,
            dimensions: Mutex::new(INITIAL_DIMENSIONS),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Last known terminal size as (cols, rows).
    pub fn dimensions(&self) -> (u32, u32) {
        *self.dimensions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }
}

/// Manages all live relay sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<RelaySession>>>,
    channels: Arc<ChannelRegistry>,
    connector: Arc<dyn ShellConnector>,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Create a session registry that forwards shell output through `channels`.
    pub fn new(
        channels: Arc<ChannelRegistry>,
        connector: Arc<dyn ShellConnector>,
        max_sessions: usize,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            channels,
            connector,
            max_sessions,
        }
    }

    /// Dial `target`, open a shell, and bind it to `channel_id`.
    ///
    /// On any failure nothing is left registered. On success exactly one
    /// output pump is running when this returns.
    pub async fn create_session(
        self: &Arc<Self>,
        channel_id: &str,
        target: ShellTarget,
    ) -> RelayResult<()> {
        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(channel_id) {
                return Err(RelayError::AlreadyBound(channel_id.to_string()));
            }
            if sessions.len() >= self.max_sessions {
                return Err(RelayError::SessionLimit(self.max_sessions));
            }
        }
        if self.channels.get(channel_id).await.is_none() {
            return Err(RelayError::ChannelClosed(channel_id.to_string()));
        }

        info!(channel_id, remote = %target.addr(), user = %target.user, "opening remote shell");
        let shell = self.connector.connect(&target).await?;
        let session = Arc::new(RelaySession::new(channel_id.to_string(), &target, shell));

        // Re-check under the write lock: a concurrent request may have won.
        let rejected = {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(channel_id) {
                Some(RelayError::AlreadyBound(channel_id.to_string()))
            } else if sessions.len() >= self.max_sessions {
                Some(RelayError::SessionLimit(self.max_sessions))
            } else {
                sessions.insert(channel_id.to_string(), session.clone());
                None
            }
        };
        if let Some(err) = rejected {
            if let Err(e) = session.shell.close().await {
                debug!(channel_id, error = %e, "closing rejected shell failed");
            }
            return Err(err);
        }

        // The browser may have left while the dial was in flight; its
        // disconnect found no session to close.
        if self.channels.get(channel_id).await.is_none() {
            debug!(channel_id, "channel gone before session start");
            self.close_if_current(&session).await;
            return Err(RelayError::ChannelClosed(channel_id.to_string()));
        }

        info!(session_id = %session.id, remote = %session.remote, "session created");

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.pump_output(session).await;
        });
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Option<Arc<RelaySession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Tear down the session bound to `id`.
    ///
    /// Returns `false` if there was nothing to close; repeated calls are no-ops.
    pub async fn close_session(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                self.teardown(session).await;
                true
            }
            None => false,
        }
    }

    /// Close `session` only if it is still the one registered under its id.
    async fn close_if_current(&self, session: &Arc<RelaySession>) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(session.id()) {
                Some(current) if Arc::ptr_eq(current, session) => sessions.remove(session.id()),
                _ => None,
            }
        };
        match removed {
            Some(session) => {
                self.teardown(session).await;
                true
            }
            None => false,
        }
    }

    async fn teardown(&self, session: Arc<RelaySession>) {
        session.cancel.send_replace(true);
        if let Err(e) = session.shell.close().await {
            warn!(session_id = %session.id, error = %e, "closing remote shell failed");
        }
        let (cols, rows) = session.dimensions();
        info!(
            session_id = %session.id(),
            remote = %session.remote(),
            user = %session.user(),
            cols,
            rows,
            age_secs = session.age_secs(),
            "session closed"
        );
    }

    /// Route one raw browser frame to the session bound to `channel_id`.
    ///
    /// Unknown message types are dropped. A failed write is reported but
    /// leaves the session open; the output pump owns ending it.
    pub async fn handle_inbound_message(&self, channel_id: &str, frame: &[u8]) -> RelayResult<()> {
        let session = self
            .get_session(channel_id)
            .await
            .ok_or_else(|| RelayError::SessionNotFound(channel_id.to_string()))?;

        match Message::decode(frame)? {
            Message::Data(text) => session.shell.write(text.as_bytes()).await,
            Message::Resize { width, height } => {
                session.shell.resize(width, height).await?;
                *session
                    .dimensions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = (width, height);
                debug!(session_id = %session.id, width, height, "terminal resized");
                Ok(())
            }
            Message::Error(text) => {
                debug!(session_id = %session.id, error = %text, "browser reported error");
                Ok(())
            }
            Message::Unknown(kind) => {
                debug!(session_id = %session.id, kind = %kind, "ignoring unknown message type");
                Ok(())
            }
        }
    }

    /// Close every live session.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for id in self.ids().await {
            if self.close_session(&id).await {
                closed += 1;
            }
        }
        closed
    }

    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Output pump: shell → channel until EOF, a read error, the browser
    /// going away, or cancellation.
    async fn pump_output(self: Arc<Self>, session: Arc<RelaySession>) {
        let mut cancel = session.cancel.subscribe();
        let mut pending = Vec::new();
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.wait_for(|cancelled| *cancelled) => {
                    debug!(session_id = %session.id, "output pump cancelled");
                    break;
                }
                read = session.shell.read_chunk() => read,
            };

            match read {
                Ok(Some(chunk)) => {
                    pending.extend_from_slice(&chunk);
                    let text = take_utf8(&mut pending);
                    if text.is_empty() {
                        continue;
                    }
                    match self.channels.send(&session.id, &Message::Data(text)).await {
                        Ok(()) => {}
                        Err(RelayError::ChannelClosed(_)) => {
                            debug!(session_id = %session.id, "channel gone, stopping output pump");
                            break;
                        }
                        Err(e) => {
                            warn!(session_id = %session.id, error = %e, "dropping shell output");
                        }
                    }
                }
                Ok(None) => {
                    if !pending.is_empty() {
                        let rest = String::from_utf8_lossy(&pending).into_owned();
                        if let Err(e) = self.channels.send(&session.id, &Message::Data(rest)).await {
                            debug!(session_id = %session.id, error = %e, "dropping trailing shell output");
                        }
                    }
                    info!(session_id = %session.id, "remote shell ended");
                    break;
                }
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "remote shell read failed");
                    break;
                }
            }
        }
        self.close_if_current(&session).await;
    }
}

/// Take the longest decodable prefix of `pending` as text, keeping an
/// incomplete trailing UTF-8 sequence for the next chunk.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let split_at = match std::str::from_utf8(&pending[..]) {
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        _ => pending.len(),
    };
    let tail = pending.split_off(split_at);
    let text = String::from_utf8_lossy(&pending[..]).into_owned();
    *pending = tail;
    text
}

#[async_trait]
impl ChannelEvents for SessionRegistry {
    async fn on_connect(&self, channel_id: &str) {
        debug!(channel_id, "channel connected");
    }

    async fn on_disconnect(&self, channel_id: &str) {
        if self.close_session(channel_id).await {
            info!(channel_id, "channel disconnected, session closed");
        }
    }

    async fn on_message(&self, channel_id: &str, frame: Vec<u8>) {
        if let Err(e) = self.handle_inbound_message(channel_id, &frame).await {
            warn!(channel_id, error = %e, "failed to handle browser message");
        }
    }
}
