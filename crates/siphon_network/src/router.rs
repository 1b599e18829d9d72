//! Inbound router: dispatches messages received from one node.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::identity::NodeId;
use crate::message::ControlMessage;
use crate::routing::SessionPathInstaller;
use crate::store::{CommandStore, StoreError, keys};
use crate::telemetry::TelemetryRecorder;

/// What the router did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Published to an external consumer's topic.
    Forwarded { topic: &'static str, receivers: usize },
    /// Written to the telemetry hashes.
    Recorded,
    /// Destination recorded and announced to every known node.
    Announced,
    /// Dropped: unknown kind, or a kind only the controller sends.
    Ignored,
}

/// Routes messages arriving on the connection of `node`.
#[derive(Clone)]
pub struct InboundRouter {
    node: NodeId,
    store: Arc<dyn CommandStore>,
    telemetry: TelemetryRecorder,
    installer: SessionPathInstaller,
}

impl InboundRouter {
    pub fn new(node: NodeId, store: Arc<dyn CommandStore>) -> Self {
        Self {
            node,
            telemetry: TelemetryRecorder::new(Arc::clone(&store)),
            installer: SessionPathInstaller::new(Arc::clone(&store)),
            store,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    async fn forward<T: Serialize>(&self, topic: &'static str, payload: &T) -> Result<Dispatched, StoreError> {
        let text = serde_json::to_string(payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let receivers = self.store.publish(topic, &text).await?;
        if receivers == 0 {
            debug!(node = %self.node, topic, "no consumer for forwarded message");
        }
        Ok(Dispatched::Forwarded { topic, receivers })
    }

    pub async fn dispatch(&self, msg: ControlMessage) -> Result<Dispatched, StoreError> {
        let kind = msg.kind();
        match msg {
            ControlMessage::NewSession(payload) | ControlMessage::QuerySessionId(payload) => {
                self.forward(keys::QUERY_SESSION_ID_TOPIC, &payload).await
            }
            ControlMessage::RoutingQuery(query) => self.forward(keys::ROUTING_INFO_TOPIC, &query).await,
            ControlMessage::RoutingInfo(directive) => {
                self.forward(keys::ROUTING_INFO_TOPIC, &directive).await
            }
            ControlMessage::ReportRtt(samples) => {
                self.telemetry.record_rtt(self.node, &samples).await?;
                Ok(Dispatched::Recorded)
            }
            ControlMessage::ReportBandwidth(report) => {
                self.telemetry
                    .record_bandwidth(self.node, report.from, report.bandwidth)
                    .await?;
                info!(node = %self.node, from = %report.from, bandwidth = report.bandwidth, "bandwidth measured");
                Ok(Dispatched::Recorded)
            }
            ControlMessage::SessionSubscribed(session_id) => {
                info!(node = %self.node, session = %session_id, "session subscribed");
                self.installer
                    .announce_destination(self.node, &session_id)
                    .await?;
                Ok(Dispatched::Announced)
            }
            ControlMessage::NodeOnline(_)
            | ControlMessage::NodeOffline(_)
            | ControlMessage::SetSessionWeight(_) => {
                warn!(node = %self.node, "discarding outbound-only {kind:?} message from node");
                Ok(Dispatched::Ignored)
            }
            ControlMessage::Unknown { code, .. } => {
                warn!(node = %self.node, code = %code, "unknown message type received");
                Ok(Dispatched::Ignored)
            }
        }
    }
}
