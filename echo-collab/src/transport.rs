//! Bidirectional byte channels between two peers.
//!
//! A [`PeerChannel`] is ordered and reliable for the life of one connection.
//! In-memory pairs back tests and same-process replicas; the WebSocket
//! adapters bridge a socket to the same shape with one reader task and one
//! writer task.
//!
//! ```text
//!  session ──► outgoing mpsc ──► writer task ──► WebSocket sink
//!  session ◄── incoming mpsc ◄── reader task ◄── WebSocket stream
//! ```

use std::collections::VecDeque;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The other end went away
    ConnectionClosed,
    /// WebSocket handshake or framing failure
    WebSocket(String),
    Io(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::WebSocket(e) => write!(f, "WebSocket error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// One connection to one peer.
pub struct PeerChannel {
    /// Local id of this connection
    id: Uuid,
    outgoing: mpsc::Sender<Vec<u8>>,
    incoming: mpsc::Receiver<Vec<u8>>,
    /// Frames handed back with [`PeerChannel::unread`]
    replay: VecDeque<Vec<u8>>,
}

impl PeerChannel {
    pub fn new(outgoing: mpsc::Sender<Vec<u8>>, incoming: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outgoing,
            incoming,
            replay: VecDeque::new(),
        }
    }

    /// Two channels wired to each other.
    pub fn pair(capacity: usize) -> (PeerChannel, PeerChannel) {
        let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
        (PeerChannel::new(a_tx, b_rx), PeerChannel::new(b_tx, a_rx))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits for room in the outgoing queue, then enqueues the frame.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Next frame from the peer; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        if let Some(frame) = self.replay.pop_front() {
            return Some(frame);
        }
        self.incoming.recv().await
    }

    /// Puts a frame back so the next `recv` returns it first.
    pub fn unread(&mut self, frame: Vec<u8>) {
        self.replay.push_front(frame);
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }
}

impl std::fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerChannel")
            .field("id", &self.id)
            .field("replay", &self.replay.len())
            .finish()
    }
}

// ─── WebSocket adapters ──────────────────────────────────────────────────────

/// Completes the server side of a WebSocket handshake.
pub async fn accept_websocket(stream: TcpStream, capacity: usize) -> Result<PeerChannel, TransportError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    Ok(bridge(ws, capacity))
}

/// Dials a WebSocket server such as `ws://127.0.0.1:9090`.
pub async fn connect_websocket(url: &str, capacity: usize) -> Result<PeerChannel, TransportError> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    Ok(bridge(ws, capacity))
}

/// Spawns the reader and writer tasks that pump frames between the socket
/// and a [`PeerChannel`]. Dropping the channel closes the socket.
pub fn bridge<S>(ws: WebSocketStream<S>, capacity: usize) -> PeerChannel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(capacity.max(1));
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(capacity.max(1));

    // Writer task: forward outgoing channel to WebSocket
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                log::debug!("WebSocket write failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader task: binary frames only
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    if in_tx.send(data.into()).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    log::debug!("WebSocket read failed: {e}");
                    break;
                }
                _ => {}
            }
        }
    });

    PeerChannel::new(out_tx, in_rx)
}
