//! Redis-backed shared store.
//!
//! Lets several controller processes, the session-ID service and the
//! routing service coordinate through one server. Every
//! [`StoreConnector::commands`] call opens its own multiplexed connection,
//! and every [`StoreConnector::subscriber`] call its own pub/sub connection.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, ErrorKind, RedisError};
use tracing::{debug, warn};

use super::{CommandStore, StoreConnector, StoreError, TopicMessage, TopicSubscriber};

fn store_error(key: &str, e: RedisError) -> StoreError {
    if e.code() == Some("WRONGTYPE") || e.kind() == ErrorKind::TypeError {
        StoreError::WrongType(key.to_string())
    } else {
        StoreError::Unavailable(e.to_string())
    }
}

/// Opens handles against a Redis server.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: redis::Client,
}

impl RedisConnector {
    /// Validate `url` (`redis://[:password@]host[:port][/db]`). No connection
    /// is made until a handle is requested.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("Invalid store URL: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn commands(&self) -> Result<Arc<dyn CommandStore>, StoreError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Arc::new(RedisCommands {
            conn: Mutex::new(Some(conn)),
        }))
    }

    async fn subscriber(&self) -> Result<Box<dyn TopicSubscriber>, StoreError> {
        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Box::new(RedisSubscriber { pubsub: Some(pubsub) }))
    }
}

// ---------------------------------------------------------------------------
// Command handle
// ---------------------------------------------------------------------------

pub struct RedisCommands {
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisCommands {
    /// Multiplexed connections are cheap to clone; each call works on its own.
    fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        self.conn.lock().clone().ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl CommandStore for RedisCommands {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection()?;
        conn.incr::<_, _, i64>(key, 1).await.map_err(|e| match e.kind() {
            ErrorKind::ResponseError => StoreError::NotAnInteger(key.to_string()),
            _ => store_error(key, e),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(|e| store_error(key, e))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection()?;
        conn.hget(key, field).await.map_err(|e| store_error(key, e))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.connection()?;
        conn.hgetall(key).await.map_err(|e| store_error(key, e))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let removed: i64 = conn.hdel(key, field).await.map_err(|e| store_error(key, e))?;
        Ok(removed > 0)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let added: i64 = conn.sadd(key, member).await.map_err(|e| store_error(key, e))?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let removed: i64 = conn.srem(key, member).await.map_err(|e| store_error(key, e))?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        let mut conn = self.connection()?;
        conn.smembers(key).await.map_err(|e| store_error(key, e))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(|e| store_error(key, e))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection()?;
        conn.get(key).await.map_err(|e| store_error(key, e))
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        conn.set_nx(key, value).await.map_err(|e| store_error(key, e))
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection()?;
        let receivers: i64 = conn
            .publish(topic, payload)
            .await
            .map_err(|e| store_error(topic, e))?;
        Ok(usize::try_from(receivers).unwrap_or(0))
    }

    async fn disconnect(&self) {
        self.conn.lock().take();
    }
}

// ---------------------------------------------------------------------------
// Subscriber handle
// ---------------------------------------------------------------------------

pub struct RedisSubscriber {
    pubsub: Option<PubSub>,
}

impl RedisSubscriber {
    fn pubsub(&mut self) -> Result<&mut PubSub, StoreError> {
        self.pubsub.as_mut().ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl TopicSubscriber for RedisSubscriber {
    async fn subscribe(&mut self, topic: &str) -> Result<(), StoreError> {
        self.pubsub()?
            .subscribe(topic)
            .await
            .map_err(|e| store_error(topic, e))
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), StoreError> {
        self.pubsub()?
            .unsubscribe(topic)
            .await
            .map_err(|e| store_error(topic, e))
    }

    async fn next_message(&mut self) -> Option<TopicMessage> {
        let pubsub = self.pubsub.as_mut()?;
        loop {
            let mut messages = std::pin::pin!(pubsub.on_message());
            let msg = messages.next().await?;
            match msg.get_payload::<String>() {
                Ok(payload) => {
                    return Some(TopicMessage {
                        topic: msg.get_channel_name().to_string(),
                        payload,
                    });
                }
                Err(e) => warn!(topic = msg.get_channel_name(), "dropping non-text topic message: {e}"),
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.pubsub.take().is_some() {
            debug!("pub/sub connection released");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
