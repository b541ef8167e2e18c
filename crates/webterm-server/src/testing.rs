//! In-memory fakes of the browser transport and the remote shell.

use crate::channel::ChannelEvents;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use webterm_core::{DuplexChannel, RelayError, RelayResult, RemoteShell, ShellConnector, ShellTarget};

/// Poll `cond` until it holds or two seconds pass.
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Browser-side fake. Frames pushed with [`FakeTransport::push`] come out of
/// `receive_frame`; [`FakeTransport::hang_up`] makes it report closure.
pub struct FakeTransport {
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
    close_count: AtomicUsize,
    fail_sends: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
        })
    }

    pub fn push(&self, frame: &str) {
        if let Some(tx) = self.inbound_tx.lock().unwrap().as_ref() {
            let _ = tx.send(frame.as_bytes().to_vec());
        }
    }

    pub fn hang_up(&self) {
        self.inbound_tx.lock().unwrap().take();
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DuplexChannel for FakeTransport {
    async fn send_frame(&self, frame: Vec<u8>) -> RelayResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(RelayError::TransportFailure("broken pipe".into()));
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn receive_frame(&self) -> RelayResult<Option<Vec<u8>>> {
        Ok(self.inbound_rx.lock().await.recv().await)
    }

    async fn close(&self) -> RelayResult<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Remote-shell fake recording every input, resize and close.
pub struct FakeShell {
    output_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    output_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
    writes: Mutex<Vec<Vec<u8>>>,
    resizes: Mutex<Vec<(u32, u32)>>,
    close_count: AtomicUsize,
    fail_writes: AtomicBool,
}

impl FakeShell {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            output_tx: Mutex::new(Some(tx)),
            output_rx: tokio::sync::Mutex::new(rx),
            closed: watch::channel(false).0,
            writes: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Make the shell produce output.
    pub fn emit(&self, data: &[u8]) {
        if let Some(tx) = self.output_tx.lock().unwrap().as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    /// End the output stream, as a remote `exit` would.
    pub fn eof(&self) {
        self.output_tx.lock().unwrap().take();
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn resizes(&self) -> Vec<(u32, u32)> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn write(&self, data: &[u8]) -> RelayResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RelayError::RemoteShellFailure("stdin closed".into()));
        }
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn read_chunk(&self) -> RelayResult<Option<Vec<u8>>> {
        let mut closed = self.closed.subscribe();
        let mut output = self.output_rx.lock().await;
        tokio::select! {
            _ = closed.wait_for(|c| *c) => Ok(None),
            chunk = output.recv() => Ok(chunk),
        }
    }

    async fn resize(&self, cols: u32, rows: u32) -> RelayResult<()> {
        self.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    async fn close(&self) -> RelayResult<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed.send_replace(true);
        Ok(())
    }
}

/// Connector handing out a fresh [`FakeShell`] per dial.
pub struct FakeConnector {
    shells: Mutex<Vec<Arc<FakeShell>>>,
    targets: Mutex<Vec<ShellTarget>>,
    refuse: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shells: Mutex::new(Vec::new()),
            targets: Mutex::new(Vec::new()),
            refuse: AtomicBool::new(false),
            gate: Mutex::new(None),
        })
    }

    /// Park every later dial until the returned gate is notified.
    pub fn hold_dials(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn dials(&self) -> usize {
        self.targets.lock().unwrap().len()
    }

    pub fn targets(&self) -> Vec<ShellTarget> {
        self.targets.lock().unwrap().clone()
    }

    /// The shell handed out by the `n`th successful dial.
    pub fn shell(&self, n: usize) -> Arc<FakeShell> {
        self.shells.lock().unwrap()[n].clone()
    }
}

#[async_trait]
impl ShellConnector for FakeConnector {
    async fn connect(&self, target: &ShellTarget) -> RelayResult<Arc<dyn RemoteShell>> {
        self.targets.lock().unwrap().push(target.clone());
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RelayError::RemoteDialFailure(format!(
                "{}: connection refused",
                target.addr()
            )));
        }
        let shell = FakeShell::new();
        self.shells.lock().unwrap().push(shell.clone());
        Ok(shell)
    }
}

/// Records every channel lifecycle callback.
#[derive(Default)]
pub struct RecordingEvents {
    pub connects: Mutex<Vec<String>>,
    pub disconnects: Mutex<Vec<String>>,
    pub messages: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingEvents {
    pub fn connects(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelEvents for RecordingEvents {
    async fn on_connect(&self, channel_id: &str) {
        self.connects.lock().unwrap().push(channel_id.to_string());
    }

    async fn on_disconnect(&self, channel_id: &str) {
        self.disconnects.lock().unwrap().push(channel_id.to_string());
    }

    async fn on_message(&self, channel_id: &str, frame: Vec<u8>) {
        self.messages
            .lock()
            .unwrap()
            .push((channel_id.to_string(), frame));
    }
}
