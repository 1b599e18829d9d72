//! Node identity: controller-issued ids and their hostnames.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Identity issued to a datapath node at registration time.
///
/// Ids come from a single store-wide counter, so a smaller id always means
/// an earlier registration. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// The name of this node's private pub/sub topic.
    pub fn topic(self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

// Datapath firmware is not consistent about quoting ids, so accept both
// `7` and `"7"`.
impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(u64),
            Str(String),
        }

        match Repr::deserialize(d)? {
            Repr::Num(n) => u32::try_from(n)
                .map(NodeId)
                .map_err(|_| serde::de::Error::custom(format!("node id {n} out of range"))),
            Repr::Str(s) => s
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("invalid node id {s:?}"))),
        }
    }
}

/// A registered node: its id and the hostname it reported in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    #[serde(rename = "NodeID")]
    pub id: NodeId,
    #[serde(rename = "Hostname")]
    pub hostname: String,
}

impl NodeIdentity {
    pub fn new(id: impl Into<NodeId>, hostname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node {} ({})", self.id, self.hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_accepts_number_and_string() {
        let a: NodeId = serde_json::from_str("7").unwrap();
        let b: NodeId = serde_json::from_str("\"7\"").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.topic(), "7");
    }

    #[test]
    fn test_node_id_rejects_garbage() {
        assert!(serde_json::from_str::<NodeId>("\"seven\"").is_err());
        assert!(serde_json::from_str::<NodeId>("-1").is_err());
        assert!(serde_json::from_str::<NodeId>("4294967296").is_err());
    }

    #[test]
    fn test_identity_wire_shape() {
        let identity = NodeIdentity::new(3, "switch-a");
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json, serde_json::json!({"NodeID": 3, "Hostname": "switch-a"}));
        assert_eq!(identity.to_string(), "Node 3 (switch-a)");
    }
}
