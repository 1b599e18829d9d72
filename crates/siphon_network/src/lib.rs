//! Siphon Network: the overlay controller's node-facing layer.
//!
//! Datapath nodes keep one TCP session open to the controller. Each session
//! is registered under a fresh node id, subscribed to a private topic in the
//! shared store, told about its peers, and then relays control messages in
//! both directions until it closes.
//!
//! # Architecture
//!
//! - **Store**: [`store::CommandStore`] / [`store::TopicSubscriber`] traits
//!   over a key-value and pub/sub store; [`store::MemoryStore`] runs it
//!   in-process and [`store::RedisConnector`] against a Redis server.
//! - **Protocol**: a little-endian hostname handshake, then NUL-delimited
//!   JSON [`ControlMessage`]s framed by [`codec::FrameCodec`].
//! - **Routing**: [`routing::SessionPathInstaller`] pushes per-hop
//!   forwarding rules to node topics; [`router::InboundRouter`] dispatches
//!   what nodes send.
//! - **Lifecycle**: [`connection::Connection`] is the per-socket state
//!   machine; [`Controller`] owns the listener and the live index.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use siphon_core::ControllerConfig;
//! use siphon_network::{Controller, MemoryStore};
//!
//! # async fn example() -> Result<(), siphon_network::NetworkError> {
//! let controller = Controller::new(ControllerConfig::default(), Arc::new(MemoryStore::new()));
//! let listener = controller.bind().await?;
//! controller.serve(listener).await?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod codec;
pub mod connection;
pub mod error;
pub mod identity;
pub mod message;
pub mod registry;
pub mod router;
pub mod routing;
pub mod server;
pub mod session_config;
pub mod store;
pub mod telemetry;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use allocator::SessionAllocator;
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use error::NetworkError;
pub use identity::{NodeId, NodeIdentity};
pub use message::{ControlMessage, MessageKind};
pub use registry::NodeRegistry;
pub use server::{Controller, LiveConnection};
pub use store::{MemoryStore, RedisConnector, StoreConnector};
