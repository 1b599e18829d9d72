//! Telemetry recorder. Keeps only the latest RTT and bandwidth sample per
//! peer pair; every report overwrites the previous value.

use std::sync::Arc;

use tracing::trace;

use crate::identity::NodeId;
use crate::message::RttSample;
use crate::store::{CommandStore, StoreError, keys};

#[derive(Clone)]
pub struct TelemetryRecorder {
    store: Arc<dyn CommandStore>,
}

impl TelemetryRecorder {
    pub fn new(store: Arc<dyn CommandStore>) -> Self {
        Self { store }
    }

    /// Hash holding `node`'s one-way latency to each peer.
    pub fn rtt_key(node: NodeId) -> String {
        node.to_string()
    }

    /// Hash holding the bandwidth each peer reported towards `node`.
    pub fn bandwidth_key(node: NodeId) -> String {
        format!("{}{node}", keys::BANDWIDTH_PREFIX)
    }

    pub async fn record_rtt(&self, node: NodeId, samples: &[RttSample]) -> Result<(), StoreError> {
        let key = Self::rtt_key(node);
        for sample in samples {
            self.store
                .hset(&key, &sample.to.to_string(), &sample.one_way.to_string())
                .await?;
        }
        trace!(node = %node, samples = samples.len(), "recorded rtt");
        Ok(())
    }

    pub async fn record_bandwidth(
        &self,
        node: NodeId,
        from: NodeId,
        bandwidth: f64,
    ) -> Result<(), StoreError> {
        self.store
            .hset(&Self::bandwidth_key(node), &from.to_string(), &bandwidth.to_string())
            .await?;
        trace!(node = %node, from = %from, bandwidth, "recorded bandwidth");
        Ok(())
    }

    /// Latest one-way latency from `node` to `to`, if reported.
    pub async fn latest_rtt(&self, node: NodeId, to: NodeId) -> Result<Option<f64>, StoreError> {
        let raw = self.store.hget(&Self::rtt_key(node), &to.to_string()).await?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    /// Latest bandwidth `from` reported towards `node`, if any.
    pub async fn latest_bandwidth(
        &self,
        node: NodeId,
        from: NodeId,
    ) -> Result<Option<f64>, StoreError> {
        let raw = self
            .store
            .hget(&Self::bandwidth_key(node), &from.to_string())
            .await?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }
}
