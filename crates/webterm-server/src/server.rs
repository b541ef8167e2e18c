//! Gateway: owns the channel and session registries and wires them together.
//!
//! Accepted browser transports are registered as channels; the session
//! registry observes channel events (disconnects close sessions, frames are
//! routed to shells) and forwards shell output back through the channels.

use crate::channel::{ChannelEvents, ChannelRegistry};
use crate::config::ServerConfig;
use crate::session::SessionRegistry;
use crate::transport::{start_listener, AcceptedTerminal};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webterm_core::{DuplexChannel, Message, RelayError, RelayResult, ShellConnector, ShellTarget};

/// Time given to outbound queues to flush after shutdown has been announced.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// The relay gateway instance.
pub struct Gateway {
    channels: Arc<ChannelRegistry>,
    sessions: Arc<SessionRegistry>,
}

impl Gateway {
    /// Build the registries and install the session registry as the channel observer.
    pub fn new(config: &ServerConfig, connector: Arc<dyn ShellConnector>) -> Self {
        let channels = Arc::new(ChannelRegistry::new(config.queue_capacity));
        let sessions = Arc::new(SessionRegistry::new(
            channels.clone(),
            connector,
            config.max_sessions,
        ));
        let events: Arc<dyn ChannelEvents> = sessions.clone();
        channels.set_events(Arc::downgrade(&events));
        Self { channels, sessions }
    }

    #[cfg(test)]
    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Register a newly accepted transport under `id`.
    ///
    /// A duplicate id is refused: the new transport gets an error message and
    /// is closed, the live channel under that id is left alone.
    pub async fn on_accept(&self, id: String, transport: Arc<dyn DuplexChannel>) -> RelayResult<()> {
        match self.channels.register(id, transport.clone()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Ok(frame) = Message::Error(format!("Failed to open channel: {e}")).encode() {
                    if let Err(send_err) = transport.send_frame(frame).await {
                        debug!(error = %send_err, "could not deliver channel error");
                    }
                }
                if let Err(close_err) = transport.close().await {
                    debug!(error = %close_err, "closing rejected transport failed");
                }
                Err(e)
            }
        }
    }

    /// Open a remote shell for the channel registered under `id`.
    ///
    /// On failure the browser is sent an `error` message and its channel is
    /// removed.
    pub async fn on_create_session_request(&self, id: &str, target: ShellTarget) -> RelayResult<()> {
        let result = match validate_target(&target) {
            Ok(()) => self.sessions.create_session(id, target).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(channel_id = id, error = %e, "failed to create session");
            let notice = Message::Error(format!("Failed to create session: {e}"));
            if let Err(send_err) = self.channels.send(id, &notice).await {
                debug!(channel_id = id, error = %send_err, "could not deliver session error");
            }
            self.channels.remove(id).await;
        }
        result
    }

    /// Handle one upgraded browser connection end to end.
    pub async fn handle_terminal(&self, accepted: AcceptedTerminal) {
        let AcceptedTerminal { channel, request } = accepted;
        let remote = channel.remote_addr();
        info!(remote = %remote, channel_id = %request.id, "terminal connection");

        if let Err(e) = self.on_accept(request.id.clone(), Arc::new(channel)).await {
            warn!(remote = %remote, channel_id = %request.id, error = %e, "rejected terminal connection");
            return;
        }
        // Errors were reported to the browser and logged.
        let _ = self
            .on_create_session_request(&request.id, request.target)
            .await;
    }

    /// Accept terminal connections until the listener stops.
    pub async fn serve(self: Arc<Self>, mut accepted_rx: mpsc::Receiver<AcceptedTerminal>) {
        while let Some(accepted) = accepted_rx.recv().await {
            let gateway = self.clone();
            tokio::spawn(async move {
                gateway.handle_terminal(accepted).await;
            });
        }
        debug!("listener closed, no more terminal connections");
    }

    /// Bind the configured address and serve until the listener stops.
    pub async fn run(self: Arc<Self>, config: &ServerConfig) -> RelayResult<()> {
        let accepted_rx = start_listener(&config.listen_addr()).await?;
        self.serve(accepted_rx).await;
        Ok(())
    }

    /// Tell every browser the server is going away, then tear everything down.
    pub async fn shutdown(&self) {
        let open_channels = self.channels.count().await;
        let open_sessions = self.sessions.count().await;
        info!(
            channels = open_channels,
            sessions = open_sessions,
            "gateway shutting down"
        );
        let notified = self
            .channels
            .broadcast(&Message::Error("server shutting down".into()))
            .await;
        let sessions = self.sessions.close_all().await;
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        for id in self.channels.ids().await {
            self.channels.remove(&id).await;
        }
        info!(notified, sessions, "gateway shut down");
    }
}

fn validate_target(target: &ShellTarget) -> RelayResult<()> {
    if target.host.is_empty() {
        return Err(RelayError::InvalidMessage("missing host".into()));
    }
    if target.user.is_empty() {
        return Err(RelayError::InvalidMessage("missing username".into()));
    }
    Ok(())
}
