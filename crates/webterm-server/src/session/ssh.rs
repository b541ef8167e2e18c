//! Remote shells over SSH using russh.
//!
//! [`SshConnector`] dials, authenticates with a password, requests a PTY and
//! an interactive shell. The resulting russh channel is owned by a single
//! actor task; [`SshShell`] is a cheap handle that talks to it.

use crate::config::SshSection;
use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Pty};
use russh_keys::key;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use webterm_core::{RelayError, RelayResult, RemoteShell, ShellConnector, ShellTarget};

const TERM: &str = "xterm";
const TTY_SPEED: u32 = 14400;

/// Output chunks buffered between the actor and the reader.
const OUTPUT_BUFFER: usize = 64;

/// russh client callbacks. Host keys are accepted and logged, not verified.
struct HostKeyLogger {
    addr: String,
}

#[async_trait]
impl client::Handler for HostKeyLogger {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        warn!(
            addr = %self.addr,
            key_type = server_public_key.name(),
            fingerprint = %server_public_key.fingerprint(),
            "accepting unverified host key"
        );
        Ok(true)
    }
}

/// Opens interactive shells on remote hosts.
pub struct SshConnector {
    connect_timeout: Duration,
    keepalive: Duration,
    buffer_size: usize,
}

impl SshConnector {
    pub fn new(config: &SshSection) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.timeout_secs),
            keepalive: Duration::from_secs(config.keepalive_secs),
            buffer_size: config.buffer_size.max(1),
        }
    }

    async fn dial(&self, target: &ShellTarget) -> RelayResult<Handle<HostKeyLogger>> {
        let config = client::Config {
            keepalive_interval: Some(self.keepalive),
            ..Default::default()
        };
        let handler = HostKeyLogger {
            addr: target.addr(),
        };

        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(Arc::new(config), (target.host.as_str(), target.port), handler),
        )
        .await
        .map_err(|_| {
            RelayError::RemoteDialFailure(format!(
                "{}: timed out after {}s",
                target.addr(),
                self.connect_timeout.as_secs()
            ))
        })?
        .map_err(|e| RelayError::RemoteDialFailure(format!("{}: {e}", target.addr())))?;

        let authenticated = tokio::time::timeout(
            self.connect_timeout,
            handle.authenticate_password(target.user.as_str(), target.credential.as_str()),
        )
        .await
        .map_err(|_| RelayError::RemoteDialFailure("authentication timed out".into()))?
        .map_err(|e| RelayError::RemoteDialFailure(format!("authentication error: {e}")))?;

        if !authenticated {
            return Err(RelayError::RemoteDialFailure(format!(
                "authentication failed for {}@{}",
                target.user,
                target.addr()
            )));
        }
        Ok(handle)
    }
}

/// Open a session channel with a PTY and start the user's shell on it.
async fn open_shell(handle: &mut Handle<HostKeyLogger>) -> RelayResult<Channel<Msg>> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| RelayError::RemoteShellFailure(format!("open session: {e}")))?;

    let (cols, rows) = crate::session::manager::INITIAL_DIMENSIONS;
    let modes = [
        (Pty::ECHO, 1),
        (Pty::TTY_OP_ISPEED, TTY_SPEED),
        (Pty::TTY_OP_OSPEED, TTY_SPEED),
    ];
    channel
        .request_pty(false, TERM, cols, rows, 0, 0, &modes)
        .await
        .map_err(|e| RelayError::RemoteShellFailure(format!("request pty: {e}")))?;
    channel
        .request_shell(false)
        .await
        .map_err(|e| RelayError::RemoteShellFailure(format!("start shell: {e}")))?;
    Ok(channel)
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn connect(&self, target: &ShellTarget) -> RelayResult<Arc<dyn RemoteShell>> {
        let mut handle = self.dial(target).await?;
        let channel = match open_shell(&mut handle).await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "", "en")
                    .await;
                return Err(e);
            }
        };
        info!(addr = %target.addr(), user = %target.user, "remote shell started");
        Ok(Arc::new(SshShell::spawn(handle, channel, self.buffer_size)))
    }
}

enum ShellCommand {
    Write {
        data: Vec<u8>,
        reply: oneshot::Sender<RelayResult<()>>,
    },
    Resize {
        cols: u32,
        rows: u32,
        reply: oneshot::Sender<RelayResult<()>>,
    },
}

/// Handle to an interactive SSH shell driven by a background actor.
pub struct SshShell {
    commands: mpsc::Sender<ShellCommand>,
    output: Mutex<mpsc::Receiver<Vec<u8>>>,
    shutdown: watch::Sender<bool>,
}

impl SshShell {
    fn spawn(handle: Handle<HostKeyLogger>, channel: Channel<Msg>, buffer_size: usize) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_BUFFER);
        let shutdown = watch::channel(false).0;

        let actor = ShellActor {
            handle,
            channel,
            buffer_size,
            commands: commands_rx,
            output: output_tx,
            shutdown: shutdown.subscribe(),
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            output: Mutex::new(output_rx),
            shutdown,
        }
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<RelayResult<()>>) -> ShellCommand,
    ) -> RelayResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| RelayError::RemoteShellFailure("shell closed".into()))?;
        reply_rx
            .await
            .map_err(|_| RelayError::RemoteShellFailure("shell closed".into()))?
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn write(&self, data: &[u8]) -> RelayResult<()> {
        let data = data.to_vec();
        self.request(|reply| ShellCommand::Write { data, reply }).await
    }

    async fn read_chunk(&self) -> RelayResult<Option<Vec<u8>>> {
        let mut shutdown = self.shutdown.subscribe();
        let mut output = self.output.lock().await;
        tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => Ok(None),
            chunk = output.recv() => Ok(chunk),
        }
    }

    async fn resize(&self, cols: u32, rows: u32) -> RelayResult<()> {
        self.request(|reply| ShellCommand::Resize { cols, rows, reply })
            .await
    }

    async fn close(&self) -> RelayResult<()> {
        self.shutdown.send_replace(true);
        Ok(())
    }
}

/// Owns the russh channel; the only task that touches it.
struct ShellActor {
    handle: Handle<HostKeyLogger>,
    channel: Channel<Msg>,
    buffer_size: usize,
    commands: mpsc::Receiver<ShellCommand>,
    output: mpsc::Sender<Vec<u8>>,
    shutdown: watch::Receiver<bool>,
}

impl ShellActor {
    async fn run(self) {
        let ShellActor {
            handle,
            mut channel,
            buffer_size,
            mut commands,
            output,
            mut shutdown,
        } = self;

        loop {
            if *shutdown.borrow() {
                debug!("shell close requested");
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                command = commands.recv() => match command {
                    Some(ShellCommand::Write { data, reply }) => {
                        let result = channel
                            .data(&data[..])
                            .await
                            .map_err(|e| RelayError::RemoteShellFailure(format!("write: {e}")));
                        let _ = reply.send(result);
                    }
                    Some(ShellCommand::Resize { cols, rows, reply }) => {
                        let result = channel
                            .window_change(cols, rows, 0, 0)
                            .await
                            .map_err(|e| RelayError::RemoteShellFailure(format!("resize: {e}")));
                        let _ = reply.send(result);
                    }
                    None => break,
                },

                message = channel.wait() => match message {
                    Some(ChannelMsg::Data { data }) => {
                        if !forward(&output, buffer_size, &data).await {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        if !forward(&output, buffer_size, &data).await {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!(exit_status, "remote shell exited");
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        debug!("remote shell channel ended");
                        break;
                    }
                    Some(_) => {}
                },
            }
        }

        let _ = channel.eof().await;
        let _ = channel.close().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(error = %e, "ssh disconnect failed");
        }
    }
}

/// Push output to the reader in pieces of at most `buffer_size` bytes.
/// Returns `false` once nobody is reading anymore.
async fn forward(output: &mpsc::Sender<Vec<u8>>, buffer_size: usize, data: &[u8]) -> bool {
    for piece in data.chunks(buffer_size) {
        if output.send(piece.to_vec()).await.is_err() {
            return false;
        }
    }
    true
}
