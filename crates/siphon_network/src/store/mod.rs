//! Shared control state: the contract the controller needs from its
//! key-value / pub-sub store.
//!
//! Every connection opens two independent handles through a
//! [`StoreConnector`]: a [`CommandStore`] for reads, writes and publishes,
//! and a [`TopicSubscriber`] that does nothing but receive its private
//! topic. A subscribe-mode handle cannot issue commands, so the two are
//! never shared.
//!
//! [`MemoryStore`] keeps everything in-process; [`RedisConnector`] talks to
//! a Redis server shared by every worker and service.
//!
//! Publishing is at-most-once: a message published before a subscriber's
//! `subscribe` call has completed is never delivered to it.

pub mod memory;
pub mod redis_store;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use redis_store::RedisConnector;

/// Well-known keys and topics.
pub mod keys {
    /// Counter issuing node ids.
    pub const CURRENT_NODE_ID: &str = "CurrentNodeID";
    pub const NODE_ID_TO_HOSTNAME: &str = "NodeID2Hostname";
    pub const HOSTNAME_TO_NODE_ID: &str = "Hostname2NodeID";
    /// Ids of nodes whose connection is currently online.
    pub const NODE_SET: &str = "NodeSet";
    pub const SESSION_TO_DESTINATION: &str = "SessionID2Destination";
    pub const REGION_TO_NODE_ID: &str = "Region2NodeID";
    pub const NODE_ID_TO_REGION: &str = "NodeID2Region";
    /// JSON blob holding the static session configuration.
    pub const CONFIGURATION: &str = "Configuration";
    /// Counter issuing session ids (allocator).
    pub const SESSION_ID: &str = "SessionID";
    pub const BANDWIDTH_PREFIX: &str = "BandwidthTo";

    /// Topic receiving forwarded `NewSession` / `QuerySessionID` payloads.
    pub const QUERY_SESSION_ID_TOPIC: &str = "querySessionID";
    /// Topic receiving forwarded next-hop queries.
    pub const ROUTING_INFO_TOPIC: &str = "routingInfo";

    /// Key of the record the allocator keeps per session.
    pub fn session_record(session_id: i64) -> String {
        format!("{SESSION_ID}:{session_id}")
    }
}

/// Errors returned by shared-store handles.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The handle was disconnected.
    #[error("Store handle closed")]
    Closed,

    /// The key holds a value of a different type.
    #[error("Wrong value type at key {0}")]
    WrongType(String),

    /// A value could not be serialized for the store.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A counter held a non-integer or overflowed.
    #[error("Value at key {0} is not an integer")]
    NotAnInteger(String),
}

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: String,
}

/// General command handle.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Atomically increment the counter at `key` and return the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    /// Returns whether the field existed.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    /// Returns whether the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    /// Returns whether the member was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Set `key` only if it does not exist yet. Returns whether it was set.
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Publish `payload` on `topic`, returning how many subscribers got it.
    async fn publish(&self, topic: &str, payload: &str) -> Result<usize, StoreError>;

    /// Release the handle. Later calls fail with [`StoreError::Closed`].
    async fn disconnect(&self);
}

/// Subscribe-mode handle.
#[async_trait]
pub trait TopicSubscriber: Send {
    /// Start receiving `topic`. Only messages published after this returns
    /// are guaranteed to be delivered.
    async fn subscribe(&mut self, topic: &str) -> Result<(), StoreError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), StoreError>;

    /// Wait for the next message. Cancel-safe; returns `None` once the
    /// handle has been disconnected.
    async fn next_message(&mut self) -> Option<TopicMessage>;

    async fn disconnect(&mut self);
}

/// Opens handles to the shared store.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn commands(&self) -> Result<Arc<dyn CommandStore>, StoreError>;
    async fn subscriber(&self) -> Result<Box<dyn TopicSubscriber>, StoreError>;
}
