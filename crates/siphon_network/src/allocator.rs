//! Session-ID allocator.
//!
//! Consumes the `querySessionID` topic. Every request
//! `{"src": <node>, "dsts": [<node>, ...], ...}` gets a fresh id from the
//! `SessionID` counter. The request is stored under `SessionID:<id>` and
//! echoed back with `SessionID` filled in, as a `NewSession` message, to
//! the source and every destination.
//!
//! The counter is seeded at [`SESSION_ID_SEED`] so allocated ids never
//! collide with the small ids used by statically configured sessions.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::identity::NodeId;
use crate::message::ControlMessage;
use crate::store::{CommandStore, StoreConnector, StoreError, TopicSubscriber, keys};

/// Allocated session ids start right after this value.
pub const SESSION_ID_SEED: i64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Malformed session request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Session request is not a JSON object")]
    NotAnObject,

    #[error("Failed to encode NewSession: {0}")]
    Encode(#[from] crate::message::CodecError),
}

#[derive(Debug, Deserialize)]
struct Endpoints {
    src: NodeId,
    #[serde(default)]
    dsts: Vec<NodeId>,
}

/// Issues session ids in response to forwarded `NewSession` requests.
pub struct SessionAllocator {
    store: Arc<dyn CommandStore>,
}

impl SessionAllocator {
    pub fn new(store: Arc<dyn CommandStore>) -> Self {
        Self { store }
    }

    /// Seed the `SessionID` counter unless another allocator already did.
    pub async fn seed(&self) -> Result<bool, StoreError> {
        let seeded = self
            .store
            .set_nx(keys::SESSION_ID, &SESSION_ID_SEED.to_string())
            .await?;
        if seeded {
            info!("session id counter seeded at {SESSION_ID_SEED}");
        }
        Ok(seeded)
    }

    /// Handle one request payload. Returns the issued session id.
    pub async fn allocate(&self, payload: &str) -> Result<i64, AllocatorError> {
        let mut request: serde_json::Value = serde_json::from_str(payload)?;
        let endpoints = Endpoints::deserialize(&request)?;

        let session_id = self.store.incr(keys::SESSION_ID).await?;
        let record = serde_json::to_string(&request)?;
        self.store
            .set(&keys::session_record(session_id), &record)
            .await?;

        request
            .as_object_mut()
            .ok_or(AllocatorError::NotAnObject)?
            .insert("SessionID".to_string(), session_id.into());
        let text = ControlMessage::NewSession(request).encode()?;

        for node in std::iter::once(endpoints.src).chain(endpoints.dsts.iter().copied()) {
            if let Err(e) = self.store.publish(&node.topic(), &text).await {
                warn!(node = %node, session = session_id, "failed to deliver NewSession: {e}");
            }
        }
        info!(
            session = session_id,
            src = %endpoints.src,
            dsts = ?endpoints.dsts,
            "session id assigned"
        );
        Ok(session_id)
    }

    /// Serve requests until `shutdown` fires or the subscription ends.
    pub async fn run(
        self,
        mut subscriber: Box<dyn TopicSubscriber>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), StoreError> {
        subscriber.subscribe(keys::QUERY_SESSION_ID_TOPIC).await?;
        debug!("session allocator subscribed to {}", keys::QUERY_SESSION_ID_TOPIC);

        loop {
            tokio::select! {
                message = subscriber.next_message() => match message {
                    Some(message) => {
                        if let Err(e) = self.allocate(&message.payload).await {
                            warn!(payload = %message.payload, "dropping session request: {e}");
                        }
                    }
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }

        subscriber.disconnect().await;
        self.store.disconnect().await;
        debug!("session allocator stopped");
        Ok(())
    }

    /// Open dedicated handles through `connector` and serve until shutdown.
    pub async fn spawn(
        connector: Arc<dyn StoreConnector>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<tokio::task::JoinHandle<Result<(), StoreError>>, StoreError> {
        let store = connector.commands().await?;
        let subscriber = connector.subscriber().await?;
        let allocator = Self::new(store);
        allocator.seed().await?;
        Ok(tokio::spawn(allocator.run(subscriber, shutdown)))
    }
}
