//! Node registry: identity issuance and the durable id↔hostname maps.
//!
//! The shared store is the only source of truth; nothing is cached here.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::identity::{NodeId, NodeIdentity};
use crate::store::{CommandStore, StoreError, keys};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The id counter produced a value that does not fit a node id.
    #[error("Node id counter out of range: {0}")]
    IdentityOverflow(i64),
}

/// Registry operations on top of one command handle.
#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<dyn CommandStore>,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn CommandStore>) -> Self {
        Self { store }
    }

    /// Issue a fresh identity for `hostname` and record both lookup maps.
    ///
    /// A single atomic increment makes concurrent registrations safe. If
    /// the store fails at any step the error is returned and the caller
    /// must treat the node as unregistered.
    pub async fn register(&self, hostname: &str) -> Result<NodeIdentity, RegistryError> {
        let raw = self.store.incr(keys::CURRENT_NODE_ID).await?;
        let id = u32::try_from(raw)
            .ok()
            .filter(|id| *id > 0)
            .map(NodeId)
            .ok_or(RegistryError::IdentityOverflow(raw))?;

        let id_str = id.to_string();
        self.store
            .hset(keys::NODE_ID_TO_HOSTNAME, &id_str, hostname)
            .await?;
        self.store
            .hset(keys::HOSTNAME_TO_NODE_ID, hostname, &id_str)
            .await?;

        debug!(node = %id, hostname, "registered node");
        Ok(NodeIdentity::new(id, hostname))
    }

    /// Every node ever registered (and not cleaned up), ordered by id.
    pub async fn known_nodes(&self) -> Result<BTreeMap<NodeId, String>, StoreError> {
        let raw = self.store.hgetall(keys::NODE_ID_TO_HOSTNAME).await?;
        let mut nodes = BTreeMap::new();
        for (id, hostname) in raw {
            match id.parse::<NodeId>() {
                Ok(id) => {
                    nodes.insert(id, hostname);
                }
                Err(_) => warn!(key = %id, "ignoring corrupt {} entry", keys::NODE_ID_TO_HOSTNAME),
            }
        }
        Ok(nodes)
    }

    pub async fn hostname_of(&self, id: NodeId) -> Result<Option<String>, StoreError> {
        self.store
            .hget(keys::NODE_ID_TO_HOSTNAME, &id.to_string())
            .await
    }

    /// The most recent id registered under `hostname`.
    pub async fn id_of(&self, hostname: &str) -> Result<Option<NodeId>, StoreError> {
        let raw = self.store.hget(keys::HOSTNAME_TO_NODE_ID, hostname).await?;
        Ok(raw.and_then(|s| s.parse().ok()))
    }

    pub async fn mark_online(&self, id: NodeId) -> Result<(), StoreError> {
        self.store.sadd(keys::NODE_SET, &id.to_string()).await?;
        Ok(())
    }

    pub async fn mark_offline(&self, id: NodeId) -> Result<(), StoreError> {
        self.store.srem(keys::NODE_SET, &id.to_string()).await?;
        Ok(())
    }

    /// Ids whose connection is currently online.
    pub async fn online_nodes(&self) -> Result<Vec<NodeId>, StoreError> {
        let members = self.store.smembers(keys::NODE_SET).await?;
        let mut ids: Vec<NodeId> = members.iter().filter_map(|m| m.parse().ok()).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Remove `identity` from both lookup maps. The hostname entry is only
    /// removed while it still points at this identity; a newer registration
    /// from the same host keeps its mapping.
    pub async fn forget(&self, identity: &NodeIdentity) -> Result<(), StoreError> {
        let id_str = identity.id.to_string();
        self.store.hdel(keys::NODE_ID_TO_HOSTNAME, &id_str).await?;

        let current = self
            .store
            .hget(keys::HOSTNAME_TO_NODE_ID, &identity.hostname)
            .await?;
        if current.as_deref() == Some(id_str.as_str()) {
            self.store
                .hdel(keys::HOSTNAME_TO_NODE_ID, &identity.hostname)
                .await?;
        }
        debug!(node = %identity.id, "forgot node mappings");
        Ok(())
    }
}
