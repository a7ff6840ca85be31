//! Dialing side: keeps one space connected to a remote server, reconnecting
//! with exponential backoff whenever the session ends.

use std::sync::Arc;

use echo_core::SpaceId;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::replicator::{Backoff, Replicator};
use crate::transport::connect_websocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the backoff delay after a failure
    Reconnecting,
}

pub struct SyncClient {
    space: SpaceId,
    url: String,
    state: watch::Receiver<ConnectionState>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Spawns the connect loop for `space` against `url`, e.g. `ws://host:9090`.
    pub fn start(replicator: Arc<Replicator>, space: SpaceId, url: impl Into<String>) -> Self {
        let url = url.into();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(connect_loop(replicator, space, url.clone(), state_tx, stop_rx));
        Self {
            space,
            url,
            state: state_rx,
            stop: stop_tx,
            task: Some(task),
        }
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits until the client reaches `state`.
    pub async fn wait_for(&self, state: ConnectionState) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|s| *s == state).await;
    }

    /// Ends the current session, if any, and stops reconnecting.
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Sync client task for {} failed: {e}", self.url);
            }
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("space", &self.space)
            .field("url", &self.url)
            .field("state", &self.state())
            .finish()
    }
}

async fn connect_loop(
    replicator: Arc<Replicator>,
    space: SpaceId,
    url: String,
    state: watch::Sender<ConnectionState>,
    mut stop: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(replicator.config().backoff.clone());

    while !*stop.borrow() && !replicator.is_shut_down() {
        let _ = state.send(ConnectionState::Connecting);
        let attempt = tokio::select! {
            result = connect_websocket(&url, replicator.config().channel_capacity) => Some(result),
            _ = stop.changed() => None,
        };

        match attempt {
            None => break,
            Some(Ok(channel)) => match replicator.on_peer_connected(space, channel).await {
                Ok(handle) => {
                    backoff.reset();
                    let _ = state.send(ConnectionState::Connected);
                    log::info!("Connected to {url} for space {space}");
                    tokio::select! {
                        _ = handle.closed() => {
                            log::info!("Session with {url} for space {space} ended");
                        }
                        _ = stop.changed() => {
                            replicator.on_peer_disconnected(&handle).await;
                            break;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Cannot sync space {space} with {url}: {e}");
                    break;
                }
            },
            Some(Err(e)) => log::debug!("Connecting to {url} failed: {e}"),
        }

        let delay = backoff.next_delay();
        let _ = state.send(ConnectionState::Reconnecting);
        log::debug!("Reconnecting to {url} in {delay:?} (attempt {})", backoff.attempt());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => break,
        }
    }
    let _ = state.send(ConnectionState::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicator::ReplicatorConfig;
    use echo_core::{Identity, SpaceBuilder};

    #[tokio::test]
    async fn test_unreachable_server_keeps_retrying() {
        let replicator = Arc::new(Replicator::new(ReplicatorConfig::for_testing()));
        let space = SpaceBuilder::new(Identity::from_seed([1; 32])).create().unwrap();
        let id = space.id();
        replicator.add_space(space).await.unwrap();

        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let client = SyncClient::start(replicator.clone(), id, format!("ws://{addr}"));
        client.wait_for(ConnectionState::Reconnecting).await;
        assert_eq!(client.space(), id);

        client.stop().await;
        assert_eq!(replicator.session_count().await, 0);
    }
}
