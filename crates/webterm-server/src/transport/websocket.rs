//! WebSocket listener using tokio-tungstenite.
//!
//! Browsers connect to `/ws/terminal/{id}?host=..&port=..&username=..&password=..`.
//! The upgrade handshake captures the path and query; each accepted socket
//! is wrapped in a [`WsChannel`] implementing [`DuplexChannel`].

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use webterm_core::{DuplexChannel, RelayError, RelayResult, ShellTarget};

/// Path prefix of terminal endpoints.
const TERMINAL_PATH: &str = "/ws/terminal";

/// Port used when the query string does not name one.
const DEFAULT_SSH_PORT: u16 = 22;

/// Maximum inbound frame size (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// What the browser asked for in its upgrade request.
#[derive(Debug, Clone)]
pub struct TerminalRequest {
    /// Channel id: the last path segment, or a random id if absent.
    pub id: String,
    pub target: ShellTarget,
}

/// An upgraded terminal connection.
pub struct AcceptedTerminal {
    pub channel: WsChannel,
    pub request: TerminalRequest,
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields upgraded terminal connections.
pub async fn start_listener(addr: &str) -> RelayResult<mpsc::Receiver<AcceptedTerminal>> {
    let tcp_listener = TcpListener::bind(addr)
        .await
        .map_err(|e| RelayError::TransportFailure(format!("WS bind failed: {e}")))?;

    info!(addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<AcceptedTerminal>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, remote)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match upgrade(stream, remote).await {
                            Ok(accepted) => {
                                if tx.send(accepted).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %remote, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

async fn upgrade(stream: TcpStream, remote: SocketAddr) -> RelayResult<AcceptedTerminal> {
    let mut parsed = None;
    let callback = |request: &Request, response: Response| match parse_request(request.uri()) {
        Some(terminal) => {
            parsed = Some(terminal);
            Ok(response)
        }
        None => Err(not_found()),
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| RelayError::TransportFailure(format!("WS upgrade failed: {e}")))?;
    let request = parsed
        .ok_or_else(|| RelayError::TransportFailure("upgrade did not yield a request".into()))?;

    debug!(remote = %remote, channel_id = %request.id, "WebSocket connection accepted");
    Ok(AcceptedTerminal {
        channel: WsChannel::new(ws_stream, remote),
        request,
    })
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("not found".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Parse `/ws/terminal[/{id}]?host=..&port=..&username=..&password=..`.
///
/// Returns `None` for any other path. Missing query values are left empty
/// and rejected later, when the session is created.
pub fn parse_request(uri: &Uri) -> Option<TerminalRequest> {
    let rest = uri.path().strip_prefix(TERMINAL_PATH)?;
    let id = match rest.trim_end_matches('/') {
        "" => generate_channel_id(),
        segment => {
            let id = segment.strip_prefix('/')?;
            if id.is_empty() || id.contains('/') {
                return None;
            }
            id.to_string()
        }
    };

    let mut target = ShellTarget::new("", DEFAULT_SSH_PORT, "", "");
    if let Some(query) = uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "host" => target.host = value.into_owned(),
                "port" => target.port = value.parse().ok()?,
                "username" => target.user = value.into_owned(),
                "password" => target.credential = value.into_owned(),
                _ => {}
            }
        }
    }

    Some(TerminalRequest { id, target })
}

/// Generate a random channel ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_channel_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// A WebSocket carrying JSON terminal messages as text frames.
pub struct WsChannel {
    sink: Mutex<SplitSink<WebSocketStream<TcpStream>, WsMessage>>,
    stream: Mutex<SplitStream<WebSocketStream<TcpStream>>>,
    remote_addr: SocketAddr,
}

impl WsChannel {
    pub fn new(ws_stream: WebSocketStream<TcpStream>, remote_addr: SocketAddr) -> Self {
        let (sink, stream) = ws_stream.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            remote_addr,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

#[async_trait]
impl DuplexChannel for WsChannel {
    async fn send_frame(&self, frame: Vec<u8>) -> RelayResult<()> {
        let text = String::from_utf8(frame)
            .map_err(|e| RelayError::InvalidMessage(format!("outbound frame is not UTF-8: {e}")))?;
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| RelayError::TransportFailure(format!("WS send failed: {e}")))
    }

    async fn receive_frame(&self) -> RelayResult<Option<Vec<u8>>> {
        let mut stream = self.stream.lock().await;
        loop {
            let data = match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
                Some(Ok(WsMessage::Binary(data))) => data,
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(RelayError::TransportFailure(format!("WS recv failed: {e}")));
                }
            };
            if data.len() > MAX_WS_FRAME_SIZE {
                warn!(
                    remote = %self.remote_addr,
                    size = data.len(),
                    max = MAX_WS_FRAME_SIZE,
                    "dropping oversized WS frame"
                );
                continue;
            }
            return Ok(Some(data));
        }
    }

    async fn close(&self) -> RelayResult<()> {
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Close(None))
            .await
            .map_err(|e| RelayError::TransportFailure(format!("WS close failed: {e}")))?;
        sink.close()
            .await
            .map_err(|e| RelayError::TransportFailure(format!("WS close failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn parses_id_and_query() {
        let request = parse_request(&uri(
            "/ws/terminal/abc123?host=10.0.0.5&port=2222&username=root&password=p%40ss%26word",
        ))
        .unwrap();
        assert_eq!(request.id, "abc123");
        assert_eq!(request.target.host, "10.0.0.5");
        assert_eq!(request.target.port, 2222);
        assert_eq!(request.target.user, "root");
        assert_eq!(request.target.credential, "p@ss&word");
    }

    #[test]
    fn port_defaults_to_ssh() {
        let request = parse_request(&uri("/ws/terminal/x?host=h&username=u")).unwrap();
        assert_eq!(request.target.port, 22);
        assert_eq!(request.target.credential, "");
    }

    #[test]
    fn missing_id_gets_random_one() {
        let a = parse_request(&uri("/ws/terminal?host=h")).unwrap();
        let b = parse_request(&uri("/ws/terminal/")).unwrap();
        assert_eq!(a.id.len(), 32);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn oversized_frame_is_dropped_and_channel_stays_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            WsChannel::new(ws, remote)
        });

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let channel = server.await.unwrap();

        client
            .send(WsMessage::Binary(vec![b'x'; MAX_WS_FRAME_SIZE + 1]))
            .await
            .unwrap();
        client
            .send(WsMessage::Text(r#"{"type":"data","payload":"ls\n"}"#.into()))
            .await
            .unwrap();

        let frame = channel.receive_frame().await.unwrap().unwrap();
        assert_eq!(frame, br#"{"type":"data","payload":"ls\n"}"#.to_vec());

        channel
            .send_frame(br#"{"type":"error","payload":"bye"}"#.to_vec())
            .await
            .unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply, WsMessage::Text(r#"{"type":"error","payload":"bye"}"#.into()));
    }

    #[test]
    fn rejects_other_paths_and_bad_ports() {
        assert!(parse_request(&uri("/api/health")).is_none());
        assert!(parse_request(&uri("/ws/terminals/x")).is_none());
        assert!(parse_request(&uri("/ws/terminal/a/b")).is_none());
        assert!(parse_request(&uri("/ws/terminal/x?port=ssh")).is_none());
    }
}
