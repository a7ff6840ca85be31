//! WebSocket listener that routes each connection to the space it asks for.
//!
//! Architecture:
//! ```text
//! Peer A ──┐                         ┌── space 1 ── session A1
//!          ├── accept ── Hello ──────┤
//! Peer B ──┘   (space id routing)    └── space 2 ── session B2
//! ```
//!
//! The first frame of a connection must be a `Hello` for a space this
//! replicator serves. Anything else gets a `Reject` and the socket closes.
//! After routing, the frame is handed back to the channel so the session
//! sees the complete handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::protocol::{MessageType, SyncMessage};
use crate::replicator::Replicator;
use crate::transport::{accept_websocket, PeerChannel};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum simultaneous sessions across all spaces
    pub max_peers: usize,
    /// Frame queue per connection
    pub channel_capacity: usize,
    /// Time a new connection has to send its `Hello`
    pub hello_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers: 256,
            channel_capacity: 256,
            hello_timeout: Duration::from_secs(10),
        }
    }
}

pub struct SyncServer {
    config: ServerConfig,
    listener: TcpListener,
    replicator: Arc<Replicator>,
}

impl SyncServer {
    /// Binds the listener; use port 0 to let the OS pick one.
    pub async fn bind(config: ServerConfig, replicator: Arc<Replicator>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(Self {
            config,
            listener,
            replicator,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// Accept loop. Runs until the listener fails or the replicator shuts down.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            if self.replicator.is_shut_down() {
                log::info!("Replicator shut down, sync server stops accepting");
                return Ok(());
            }
            log::debug!("New TCP connection from {addr}");

            let replicator = self.replicator.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, replicator, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handshake and routing of a single connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        replicator: Arc<Replicator>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut channel = accept_websocket(stream, config.channel_capacity).await?;
        log::info!("WebSocket connection established: {addr}");

        let frame = match tokio::time::timeout(config.hello_timeout, channel.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::debug!("{addr} closed before its handshake");
                return Ok(());
            }
            Err(_) => {
                log::warn!("{addr} sent no handshake within {:?}", config.hello_timeout);
                return Ok(());
            }
        };

        let hello = SyncMessage::decode(&frame)?;
        if hello.msg_type != MessageType::Hello {
            return refuse(&channel, &replicator, &hello, "expected Hello".to_string()).await;
        }
        if replicator.space(&hello.space_id).await.is_none() {
            let reason = format!("space {} is not served here", hello.space_id);
            return refuse(&channel, &replicator, &hello, reason).await;
        }
        let open = replicator.session_count().await;
        if open >= config.max_peers {
            let reason = format!("server full ({open} sessions)");
            return refuse(&channel, &replicator, &hello, reason).await;
        }

        channel.unread(frame);
        let handle = replicator.on_peer_connected(hello.space_id, channel).await?;
        log::info!("Peer {} joined space {} as session {}", hello.peer_id, hello.space_id, handle.id());
        handle.closed().await;
        Ok(())
    }
}

async fn refuse(
    channel: &PeerChannel,
    replicator: &Replicator,
    hello: &SyncMessage,
    reason: String,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    log::warn!("Refusing peer {}: {reason}", hello.peer_id);
    let reject = SyncMessage::reject(replicator.peer_id(), hello.space_id, reason)?;
    channel.send(reject.encode()?).await?;
    Ok(())
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.config)
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Hello;
    use crate::replicator::ReplicatorConfig;
    use crate::transport::connect_websocket;
    use echo_core::{Identity, SpaceId};
    use uuid::Uuid;

    async fn server() -> (SocketAddr, Arc<Replicator>) {
        let replicator = Arc::new(Replicator::new(ReplicatorConfig::for_testing()));
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let server = SyncServer::bind(config, replicator.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, replicator)
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers, 256);
        assert_eq!(config.channel_capacity, 256);
    }

    #[tokio::test]
    async fn test_unknown_space_rejected() {
        let (addr, _replicator) = server().await;
        let mut channel = connect_websocket(&format!("ws://{addr}"), 8).await.unwrap();

        let space = SpaceId::new();
        let hello = Hello {
            version: crate::protocol::PROTOCOL_VERSION,
            actor: Identity::from_seed([9; 32]).actor(),
            space,
        };
        let frame = SyncMessage::hello(Uuid::new_v4(), &hello).unwrap().encode().unwrap();
        channel.send(frame).await.unwrap();

        let reply = SyncMessage::decode(&channel.recv().await.unwrap()).unwrap();
        assert_eq!(reply.msg_type, MessageType::Reject);
        assert!(reply.reject_payload().unwrap().reason.contains("not served"));
    }

    #[tokio::test]
    async fn test_first_frame_must_be_hello() {
        let (addr, _replicator) = server().await;
        let mut channel = connect_websocket(&format!("ws://{addr}"), 8).await.unwrap();

        let ping = SyncMessage::ping(Uuid::new_v4(), SpaceId::new()).encode().unwrap();
        channel.send(ping).await.unwrap();

        let reply = SyncMessage::decode(&channel.recv().await.unwrap()).unwrap();
        assert_eq!(reply.msg_type, MessageType::Reject);
    }
}
