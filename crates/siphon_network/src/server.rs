//! Controller: accepts node sockets and tracks live connections.
//!
//! [`Controller`] is the primary public API for siphon_network. It manages:
//! - the TCP listener and its accept loop
//! - one [`Connection`] task per accepted socket
//! - the live-connection index fed by [`ConnectionEvent`]s
//! - the shutdown broadcast that closes every connection

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use siphon_core::ControllerConfig;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionEvent, ConnectionSettings, ConnectionState};
use crate::error::NetworkError;
use crate::identity::NodeId;
use crate::store::StoreConnector;

/// A connection the listener currently owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveConnection {
    pub hostname: String,
    pub addr: SocketAddr,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
}

/// The node listener.
pub struct Controller {
    /// Controller configuration.
    config: ControllerConfig,
    /// Opens the per-connection store handles.
    connector: Arc<dyn StoreConnector>,
    /// Registered connections keyed by node id.
    live: Arc<RwLock<HashMap<NodeId, LiveConnection>>>,
    /// Shutdown signal broadcaster.
    shutdown_tx: broadcast::Sender<()>,
}

impl Controller {
    pub fn new(config: ControllerConfig, connector: Arc<dyn StoreConnector>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(8);
        Self {
            config,
            connector,
            live: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, NetworkError> {
        let addr = self.config.listen_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind { addr, source })
    }

    /// A sender that stops [`serve`](Self::serve) when signalled.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Snapshot of the live-connection index, ordered by node id.
    pub async fn live_connections(&self) -> Vec<(NodeId, LiveConnection)> {
        let live = self.live.read().await;
        let mut out: Vec<_> = live.iter().map(|(id, c)| (*id, c.clone())).collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Run the accept loop until shutdown (returns `Ok`) or a fatal accept
    /// error (returns `Err` after closing every connection).
    pub async fn serve(&self, listener: TcpListener) -> Result<(), NetworkError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let (event_tx, event_rx) = mpsc::channel(self.config.event_channel_capacity.max(1));
        let settings = ConnectionSettings::from(&self.config);

        let live = Arc::clone(&self.live);
        tokio::spawn(async move {
            Self::event_loop(event_rx, live).await;
        });

        match listener.local_addr() {
            Ok(addr) => info!("controller listening on {addr}"),
            Err(e) => warn!("controller listening on unknown address: {e}"),
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "accepted node socket");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(addr = %addr, "set_nodelay failed: {e}");
                        }
                        let connection = Connection::new(
                            addr,
                            settings.clone(),
                            Arc::clone(&self.connector),
                            event_tx.clone(),
                        );
                        let conn_shutdown = self.shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            let _ = connection.run(stream, conn_shutdown).await;
                        });
                    }
                    Err(e) if is_transient(&e) => {
                        warn!("accept failed, continuing: {e}");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => {
                        error!("listener failed: {e}");
                        let _ = self.shutdown_tx.send(());
                        return Err(NetworkError::Listener(e));
                    }
                },
                _ = shutdown.recv() => {
                    info!("controller shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Apply lifecycle events to the live-connection index.
    async fn event_loop(
        mut event_rx: mpsc::Receiver<ConnectionEvent>,
        live: Arc<RwLock<HashMap<NodeId, LiveConnection>>>,
    ) {
        while let Some(event) = event_rx.recv().await {
            match event {
                ConnectionEvent::Registered { id, hostname, addr } => {
                    live.write().await.insert(
                        id,
                        LiveConnection {
                            hostname,
                            addr,
                            state: ConnectionState::Registered,
                            connected_at: Utc::now(),
                        },
                    );
                }
                ConnectionEvent::Online { id } => {
                    if let Some(conn) = live.write().await.get_mut(&id) {
                        conn.state = ConnectionState::Online;
                    }
                }
                ConnectionEvent::Closed { id: Some(id), addr } => {
                    if let Some(conn) = live.write().await.remove(&id) {
                        let uptime = Utc::now() - conn.connected_at;
                        info!(node = %id, addr = %addr, "connection to node {id} ({}) closed after {}s", conn.hostname, uptime.num_seconds());
                    }
                }
                ConnectionEvent::Closed { id: None, addr } => {
                    debug!(addr = %addr, "unregistered socket closed");
                }
            }
        }
        debug!("event loop finished");
    }
}

/// Accept errors that concern one socket, or that pass once load drops.
fn is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    // ENFILE / EMFILE: descriptor exhaustion.
    matches!(e.raw_os_error(), Some(23) | Some(24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn local_config() -> ControllerConfig {
        ControllerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_bind_and_shutdown() {
        let controller = Arc::new(Controller::new(local_config(), Arc::new(MemoryStore::new())));
        let listener = controller.bind().await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);

        let c = Arc::clone(&controller);
        let task = tokio::spawn(async move { c.serve(listener).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        controller.shutdown();
        task.await.unwrap().unwrap();
        assert!(controller.live_connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_bind_conflict_reported() {
        let first = Controller::new(local_config(), Arc::new(MemoryStore::new()));
        let listener = first.bind().await.unwrap();

        let mut config = local_config();
        config.listen_addr = listener.local_addr().unwrap();
        let second = Controller::new(config, Arc::new(MemoryStore::new()));
        assert!(matches!(second.bind().await, Err(NetworkError::Bind { .. })));
    }
}
