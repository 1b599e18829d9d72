//! Session path installation.
//!
//! Forwarding rules are never stored. Each rule becomes a `RoutingInfo`
//! message published to the private topic of the node that owns it, and
//! delivery is at-most-once.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::identity::{NodeId, NodeIdentity};
use crate::message::ControlMessage;
use crate::registry::NodeRegistry;
use crate::session_config::{self, PseudoSession};
use crate::store::{CommandStore, StoreError, keys};

/// A per-hop directive: `node` forwards `session_id` to `next_hop`.
/// The final hop of a path points at itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingRule {
    pub session_id: String,
    pub node: NodeId,
    pub next_hop: NodeId,
}

impl ForwardingRule {
    pub fn to_message(&self) -> ControlMessage {
        ControlMessage::routing_info(self.session_id.clone(), self.next_hop)
    }
}

/// The region of a session: the token between the first and second `.`.
pub fn region_of(session_id: &str) -> Option<&str> {
    session_id.split('.').nth(1)
}

/// Rules to install once `new_id` comes online.
///
/// A session is installed only when its path contains `new_id` and `new_id`
/// is the largest id in the path. Ids grow with registration order, so the
/// largest id stands in for "last member to connect". Nothing checks that
/// the other members are actually online.
pub fn plan_static_rules(sessions: &[PseudoSession], new_id: NodeId) -> Vec<ForwardingRule> {
    let mut rules = Vec::new();
    for session in sessions {
        let path = &session.path;
        if !path.contains(&new_id) || path.iter().any(|hop| *hop > new_id) {
            continue;
        }

        for pair in path.windows(2) {
            rules.push(ForwardingRule {
                session_id: session.session_id.clone(),
                node: pair[0],
                next_hop: pair[1],
            });
        }
        if let Some(last) = path.last() {
            rules.push(ForwardingRule {
                session_id: session.session_id.clone(),
                node: *last,
                next_hop: *last,
            });
        }
    }
    rules
}

/// Pushes routing state to nodes through their private topics.
#[derive(Clone)]
pub struct SessionPathInstaller {
    store: Arc<dyn CommandStore>,
    registry: NodeRegistry,
}

impl SessionPathInstaller {
    pub fn new(store: Arc<dyn CommandStore>) -> Self {
        let registry = NodeRegistry::new(Arc::clone(&store));
        Self { store, registry }
    }

    /// Publish `msg` to `node`'s topic. Failures are logged, not returned.
    async fn publish_to(&self, node: NodeId, msg: &ControlMessage) -> usize {
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(node = %node, "failed to encode {:?}: {e}", msg.kind());
                return 0;
            }
        };
        match self.store.publish(&node.topic(), &text).await {
            Ok(receivers) => receivers,
            Err(e) => {
                warn!(node = %node, "publish failed: {e}");
                0
            }
        }
    }

    /// Announce `identity` to every other known node and return the
    /// messages that must be written straight to the new node's socket.
    ///
    /// The new node learns about its peers through the returned messages
    /// rather than its topic, because its subscription may not be live yet
    /// from the publisher's point of view. With no peers, nothing is
    /// published and nothing is returned.
    pub async fn announce_online(
        &self,
        identity: &NodeIdentity,
    ) -> Result<Vec<ControlMessage>, StoreError> {
        let peers: Vec<NodeIdentity> = self
            .registry
            .known_nodes()
            .await?
            .into_iter()
            .filter(|(id, _)| *id != identity.id)
            .map(|(id, hostname)| NodeIdentity::new(id, hostname))
            .collect();

        if peers.is_empty() {
            debug!(node = %identity.id, "first node online, no peers to announce");
            return Ok(Vec::new());
        }

        let online = ControlMessage::node_online(vec![identity.clone()]);
        let direct_route = ControlMessage::routing_info(identity.id.to_string(), identity.id);
        for peer in &peers {
            self.publish_to(peer.id, &online).await;
            self.publish_to(peer.id, &direct_route).await;
        }

        let routes: Vec<ControlMessage> = peers
            .iter()
            .map(|peer| ControlMessage::routing_info(peer.id.to_string(), peer.id))
            .collect();
        info!(node = %identity.id, peers = peers.len(), "announced node online");

        let mut direct = vec![ControlMessage::node_online(peers)];
        direct.extend(routes);
        Ok(direct)
    }

    /// Install every configured session for which `new_id` completes the path.
    pub async fn install_static(&self, new_id: NodeId) -> Result<Vec<ForwardingRule>, StoreError> {
        let config = session_config::fetch(self.store.as_ref()).await?;
        let rules = plan_static_rules(&config.pseudo_sessions, new_id);
        if !rules.is_empty() {
            debug!(node = %new_id, rules = rules.len(), "installing static session paths");
        }
        for rule in &rules {
            self.publish_to(rule.node, &rule.to_message()).await;
        }
        Ok(rules)
    }

    /// Record `node` as the destination of `session_id` and tell every known
    /// node to route that session towards it.
    pub async fn announce_destination(&self, node: NodeId, session_id: &str) -> Result<(), StoreError> {
        let node_str = node.to_string();
        self.store
            .hset(keys::SESSION_TO_DESTINATION, session_id, &node_str)
            .await?;

        match region_of(session_id) {
            Some(region) => {
                self.store.hset(keys::REGION_TO_NODE_ID, region, &node_str).await?;
                self.store.hset(keys::NODE_ID_TO_REGION, &node_str, region).await?;
            }
            None => warn!(node = %node, session = session_id, "session id has no region"),
        }

        let msg = ControlMessage::routing_info(session_id, node);
        let known = self.registry.known_nodes().await?;
        for id in known.keys() {
            self.publish_to(*id, &msg).await;
        }
        info!(node = %node, session = session_id, notified = known.len(), "session destination announced");
        Ok(())
    }
}
