//! Per-socket connection state machine.
//!
//! ```text
//! Connecting --handshake--> Registered --subscribe+announce--> Online --close--> Closed
//! ```
//!
//! The handshake is a 4-byte little-endian hostname length, the hostname
//! bytes, and a 4-byte little-endian node id written back. After that both
//! directions carry NUL-delimited JSON control messages. Anything published
//! on the node's private topic is written to the socket as-is.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use siphon_core::{ControllerConfig, RetentionPolicy};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{FrameCodec, FrameError};
use crate::identity::{NodeId, NodeIdentity};
use crate::message::ControlMessage;
use crate::registry::{NodeRegistry, RegistryError};
use crate::router::InboundRouter;
use crate::routing::SessionPathInstaller;
use crate::store::{CommandStore, StoreConnector, StoreError, TopicSubscriber};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Hostname length {len} exceeds limit {max}")]
    HostnameTooLong { len: usize, max: usize },

    #[error("Hostname is not ASCII")]
    InvalidHostname,

    #[error("Registration failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// The private topic subscription ended underneath the connection.
    #[error("Topic subscription lost")]
    SubscriptionLost,
}

/// Lifecycle of one connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registered,
    Online,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Registered => "registered",
            Self::Online => "online",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lifecycle transitions reported to the owning listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Registered {
        id: NodeId,
        hostname: String,
        addr: SocketAddr,
    },
    Online {
        id: NodeId,
    },
    /// `id` is `None` when the socket closed before registration.
    Closed {
        id: Option<NodeId>,
        addr: SocketAddr,
    },
}

/// Per-connection limits and policies.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub handshake_timeout: Duration,
    pub max_hostname_len: usize,
    pub max_frame_len: usize,
    pub retention: RetentionPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for ConnectionSettings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            max_hostname_len: config.max_hostname_len,
            max_frame_len: config.max_frame_len,
            retention: config.identity_retention,
        }
    }
}

/// One accepted node socket.
pub struct Connection {
    addr: SocketAddr,
    settings: ConnectionSettings,
    connector: Arc<dyn StoreConnector>,
    events: mpsc::Sender<ConnectionEvent>,
    state: ConnectionState,
    identity: Option<NodeIdentity>,
}

impl Connection {
    pub fn new(
        addr: SocketAddr,
        settings: ConnectionSettings,
        connector: Arc<dyn StoreConnector>,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            addr,
            settings,
            connector,
            events,
            state: ConnectionState::Connecting,
            identity: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn identity(&self) -> Option<&NodeIdentity> {
        self.identity.as_ref()
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(addr = %self.addr, from = %self.state, to = %next, "connection state");
        self.state = next;
    }

    async fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).await.is_err() {
            trace!(addr = %self.addr, "listener gone, lifecycle event dropped");
        }
    }

    /// Drive the connection until the socket closes, an error occurs, or
    /// `shutdown` fires. Store handles are always released on return.
    pub async fn run<S>(
        mut self,
        stream: S,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let commands = match self.connector.commands().await {
            Ok(commands) => commands,
            Err(e) => {
                self.close(None, None).await;
                return Err(e.into());
            }
        };
        let mut subscriber = match self.connector.subscriber().await {
            Ok(subscriber) => subscriber,
            Err(e) => {
                self.close(Some(commands), None).await;
                return Err(e.into());
            }
        };

        let result = self
            .serve(stream, &commands, subscriber.as_mut(), &mut shutdown)
            .await;
        if let Err(e) = &result {
            match self.identity() {
                Some(identity) => warn!(addr = %self.addr, node = %identity.id, "connection lost: {e}"),
                None => warn!(addr = %self.addr, "connection failed before registration: {e}"),
            }
        }
        self.close(Some(commands), Some(subscriber)).await;
        result
    }

    async fn serve<S>(
        &mut self,
        mut stream: S,
        commands: &Arc<dyn CommandStore>,
        subscriber: &mut dyn TopicSubscriber,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let registry = NodeRegistry::new(Arc::clone(commands));
        let pending = tokio::time::timeout(
            self.settings.handshake_timeout,
            handshake(&mut stream, &registry, self.settings.max_hostname_len),
        );
        let identity = tokio::select! {
            result = pending => result
                .map_err(|_| ConnectionError::HandshakeTimeout(self.settings.handshake_timeout))??,
            _ = shutdown.recv() => {
                debug!(addr = %self.addr, "controller shutting down, abandoning handshake");
                return Ok(());
            }
        };

        let id = identity.id;
        self.identity = Some(identity.clone());
        self.transition(ConnectionState::Registered);
        self.emit(ConnectionEvent::Registered {
            id,
            hostname: identity.hostname.clone(),
            addr: self.addr,
        })
        .await;

        // Subscribe before announcing, or replies to the announcement can be lost.
        subscriber.subscribe(&id.topic()).await?;
        if let Err(e) = registry.mark_online(id).await {
            warn!(node = %id, "failed to add node to online set: {e}");
        }
        self.transition(ConnectionState::Online);
        self.emit(ConnectionEvent::Online { id }).await;
        info!(node = %id, hostname = %identity.hostname, addr = %self.addr, "connection established");

        let mut framed = Framed::new(stream, FrameCodec::new(self.settings.max_frame_len));

        let installer = SessionPathInstaller::new(Arc::clone(commands));
        match installer.announce_online(&identity).await {
            Ok(direct) => {
                for msg in &direct {
                    match msg.encode() {
                        Ok(text) => framed.feed(text).await?,
                        Err(e) => warn!(node = %id, "skipping unencodable peer update: {e}"),
                    }
                }
                framed.flush().await?;
            }
            Err(e) => warn!(node = %id, "online declaration failed: {e}"),
        }
        if let Err(e) = installer.install_static(id).await {
            warn!(node = %id, "static session installation failed: {e}");
        }

        let router = InboundRouter::new(id, Arc::clone(commands));
        loop {
            tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => handle_frame(&router, &frame).await,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        debug!(node = %id, "node closed the connection");
                        return Ok(());
                    }
                },
                published = subscriber.next_message() => match published {
                    Some(message) => {
                        if message.payload.contains('\0') {
                            warn!(node = %id, "dropping topic message containing NUL");
                            continue;
                        }
                        trace!(node = %id, payload = %message.payload, "relaying to node");
                        framed.send(message.payload).await?;
                    }
                    None => return Err(ConnectionError::SubscriptionLost),
                },
                _ = shutdown.recv() => {
                    debug!(node = %id, "controller shutting down, closing connection");
                    return Ok(());
                }
            }
        }
    }

    /// Release both store handles and report the close. Online-set and
    /// mapping cleanup runs in the background so a slow store cannot hold
    /// the close up.
    async fn close(
        &mut self,
        commands: Option<Arc<dyn CommandStore>>,
        subscriber: Option<Box<dyn TopicSubscriber>>,
    ) {
        if let Some(mut subscriber) = subscriber {
            subscriber.disconnect().await;
        }

        if let Some(commands) = commands {
            let identity = self.identity.clone();
            let retention = self.settings.retention;
            tokio::spawn(async move {
                if let Some(identity) = identity {
                    let registry = NodeRegistry::new(Arc::clone(&commands));
                    if let Err(e) = registry.mark_offline(identity.id).await {
                        debug!(node = %identity.id, "failed to remove node from online set: {e}");
                    }
                    if retention == RetentionPolicy::Cleanup {
                        if let Err(e) = registry.forget(&identity).await {
                            error!(node = %identity.id, "failed to clean up node mappings: {e}");
                        }
                    }
                }
                commands.disconnect().await;
            });
        }

        self.transition(ConnectionState::Closed);
        let id = self.identity.as_ref().map(|identity| identity.id);
        self.emit(ConnectionEvent::Closed { id, addr: self.addr }).await;
    }
}

/// Read the hostname, register it, and reply with the issued id.
async fn handshake<S>(
    stream: &mut S,
    registry: &NodeRegistry,
    max_hostname_len: usize,
) -> Result<NodeIdentity, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = stream.read_u32_le().await? as usize;
    if len > max_hostname_len {
        return Err(ConnectionError::HostnameTooLong { len, max: max_hostname_len });
    }

    let mut raw = vec![0u8; len];
    stream.read_exact(&mut raw).await?;
    if !raw.is_ascii() {
        return Err(ConnectionError::InvalidHostname);
    }
    let hostname = String::from_utf8(raw).map_err(|_| ConnectionError::InvalidHostname)?;

    let identity = registry.register(&hostname).await?;
    stream.write_u32_le(identity.id.as_u32()).await?;
    stream.flush().await?;
    Ok(identity)
}

async fn handle_frame(router: &InboundRouter, frame: &[u8]) {
    let msg = match ControlMessage::decode(frame) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(
                node = %router.node(),
                frame = %String::from_utf8_lossy(frame),
                "dropping undecodable frame: {e}"
            );
            return;
        }
    };

    trace!(node = %router.node(), kind = ?msg.kind(), "received message");
    match router.dispatch(msg).await {
        Ok(outcome) => trace!(node = %router.node(), ?outcome, "dispatched"),
        Err(e) => warn!(node = %router.node(), "failed to handle message: {e}"),
    }
}
