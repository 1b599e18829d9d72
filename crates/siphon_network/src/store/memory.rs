//! In-process shared store.
//!
//! Behaves like the subset of a Redis server the controller relies on:
//! string/hash/set values, atomic counters, and fire-and-forget topic
//! fan-out. All handles opened from one [`MemoryStore`] see the same data.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{CommandStore, StoreConnector, StoreError, TopicMessage, TopicSubscriber};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

type SubscriberId = u64;

#[derive(Debug)]
struct Inner {
    data: Mutex<HashMap<String, Value>>,
    topics: Mutex<HashMap<String, Vec<(SubscriberId, mpsc::UnboundedSender<TopicMessage>)>>>,
    next_subscriber: AtomicU64,
    available: AtomicBool,
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        }
    }

    fn remove_subscriber(&self, topic: &str, id: SubscriberId) {
        let mut topics = self.topics.lock();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|(sid, _)| *sid != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// Shared in-memory store. Cloning yields another reference to the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(HashMap::new()),
                topics: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`). While unavailable
    /// every operation on every handle fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.lock().get(topic).map_or(0, Vec::len)
    }

    /// Open a command handle with its concrete type.
    pub fn command_handle(&self) -> MemoryCommands {
        MemoryCommands {
            inner: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a subscribe-mode handle with its concrete type.
    pub fn subscriber_handle(&self) -> MemorySubscriber {
        let (tx, rx) = mpsc::unbounded_channel();
        MemorySubscriber {
            inner: Arc::clone(&self.inner),
            id: self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed),
            tx,
            rx,
            topics: HashSet::new(),
            closed: false,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn commands(&self) -> Result<Arc<dyn CommandStore>, StoreError> {
        self.inner.check_available()?;
        Ok(Arc::new(self.command_handle()))
    }

    async fn subscriber(&self) -> Result<Box<dyn TopicSubscriber>, StoreError> {
        self.inner.check_available()?;
        Ok(Box::new(self.subscriber_handle()))
    }
}

// ---------------------------------------------------------------------------
// Command handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MemoryCommands {
    inner: Arc<Inner>,
    closed: AtomicBool,
}

impl MemoryCommands {
    fn check(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.inner.check_available()
    }
}

#[async_trait]
impl CommandStore for MemoryCommands {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.check()?;
        let mut data = self.inner.data.lock();
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Value::Str("0".to_string()));
        match entry {
            Value::Str(s) => {
                let next = s
                    .parse::<i64>()
                    .ok()
                    .and_then(|n| n.checked_add(1))
                    .ok_or_else(|| StoreError::NotAnInteger(key.to_string()))?;
                *s = next.to_string();
                Ok(next)
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut data = self.inner.data.lock();
        match data
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()))
        {
            Value::Hash(hash) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        match self.inner.data.lock().get(key) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check()?;
        match self.inner.data.lock().get(key) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut data = self.inner.data.lock();
        match data.get_mut(key) {
            None => Ok(false),
            Some(Value::Hash(hash)) => {
                let existed = hash.remove(field).is_some();
                if hash.is_empty() {
                    data.remove(key);
                }
                Ok(existed)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut data = self.inner.data.lock();
        match data
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(BTreeSet::new()))
        {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut data = self.inner.data.lock();
        match data.get_mut(key) {
            None => Ok(false),
            Some(Value::Set(set)) => {
                let existed = set.remove(member);
                if set.is_empty() {
                    data.remove(key);
                }
                Ok(existed)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        self.check()?;
        match self.inner.data.lock().get(key) {
            None => Ok(BTreeSet::new()),
            Some(Value::Set(set)) => Ok(set.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner
            .data
            .lock()
            .insert(key.to_string(), Value::Str(value.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        match self.inner.data.lock().get(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut data = self.inner.data.lock();
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(key.to_string(), Value::Str(value.to_string()));
        Ok(true)
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<usize, StoreError> {
        self.check()?;
        let mut topics = self.inner.topics.lock();
        let Some(subs) = topics.get_mut(topic) else {
            trace!(topic, "publish with no subscribers");
            return Ok(0);
        };

        let message = TopicMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        };
        subs.retain(|(_, tx)| tx.send(message.clone()).is_ok());
        let delivered = subs.len();
        if subs.is_empty() {
            topics.remove(topic);
        }
        Ok(delivered)
    }

    async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Subscriber handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MemorySubscriber {
    inner: Arc<Inner>,
    id: SubscriberId,
    tx: mpsc::UnboundedSender<TopicMessage>,
    rx: mpsc::UnboundedReceiver<TopicMessage>,
    topics: HashSet<String>,
    closed: bool,
}

#[async_trait]
impl TopicSubscriber for MemorySubscriber {
    async fn subscribe(&mut self, topic: &str) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        self.inner.check_available()?;
        if self.topics.insert(topic.to_string()) {
            self.inner
                .topics
                .lock()
                .entry(topic.to_string())
                .or_default()
                .push((self.id, self.tx.clone()));
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        if self.topics.remove(topic) {
            self.inner.remove_subscriber(topic, self.id);
        }
        Ok(())
    }

    async fn next_message(&mut self) -> Option<TopicMessage> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for topic in self.topics.drain() {
            self.inner.remove_subscriber(&topic, self.id);
        }
        self.rx.close();
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        for topic in self.topics.drain() {
            self.inner.remove_subscriber(&topic, self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
