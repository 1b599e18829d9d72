//! Control message protocol: the typed `{"Type": n, "Msg": ...}` envelope
//! exchanged with datapath nodes and carried on private topics.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::{NodeId, NodeIdentity};

/// Wire codes of the control message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    NodeOnline,
    NodeOffline,
    NewSession,
    QuerySessionId,
    RoutingInfo,
    ReportRtt,
    ReportBandwidth,
    SessionSubscribed,
    SetSessionWeight,
}

impl MessageKind {
    pub const fn code(self) -> u64 {
        match self {
            Self::NodeOnline => 1,
            Self::NodeOffline => 2,
            Self::NewSession => 3,
            Self::QuerySessionId => 4,
            Self::RoutingInfo => 5,
            Self::ReportRtt => 6,
            Self::ReportBandwidth => 7,
            Self::SessionSubscribed => 8,
            Self::SetSessionWeight => 9,
        }
    }

    pub const fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            1 => Self::NodeOnline,
            2 => Self::NodeOffline,
            3 => Self::NewSession,
            4 => Self::QuerySessionId,
            5 => Self::RoutingInfo,
            6 => Self::ReportRtt,
            7 => Self::ReportBandwidth,
            8 => Self::SessionSubscribed,
            9 => Self::SetSessionWeight,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NodeOnline => "NodeOnline",
            Self::NodeOffline => "NodeOffline",
            Self::NewSession => "NewSession",
            Self::QuerySessionId => "QuerySessionID",
            Self::RoutingInfo => "RoutingInfo",
            Self::ReportRtt => "ReportRTT",
            Self::ReportBandwidth => "ReportBandwidth",
            Self::SessionSubscribed => "SessionSubscribed",
            Self::SetSessionWeight => "SetSessionWeight",
        };
        f.write_str(name)
    }
}

/// Errors produced while encoding or decoding a control message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed control message: {0}")]
    Malformed(&'static str),

    #[error("Invalid {kind} payload: {source}")]
    Payload {
        kind: MessageKind,
        source: serde_json::Error,
    },

    #[error("Encoded message contains a NUL byte")]
    EmbeddedNul,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Announces one or more nodes that are online.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOnline {
    #[serde(rename = "NewNode")]
    pub new_node: Vec<NodeIdentity>,
}

/// Announces a node that went away. Understood by the datapath, not sent by
/// the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOffline {
    #[serde(rename = "OfflineNode")]
    pub offline_node: NodeId,
}

/// A forwarding directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingInfo {
    #[serde(rename = "SessionID", deserialize_with = "lenient::string")]
    pub session_id: String,
    #[serde(rename = "Entry", default)]
    pub entry: Vec<NodeId>,
    /// Reserved, always 0.
    #[serde(rename = "Timeout", default)]
    pub timeout: u64,
}

impl RoutingInfo {
    /// A directive sending `session_id` to `next_hop`.
    pub fn next_hop(session_id: impl Into<String>, next_hop: NodeId) -> Self {
        Self {
            session_id: session_id.into(),
            entry: vec![next_hop],
            timeout: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RttSample {
    #[serde(rename = "To")]
    pub to: NodeId,
    #[serde(rename = "OneWay", deserialize_with = "lenient::number")]
    pub one_way: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthReport {
    #[serde(rename = "From")]
    pub from: NodeId,
    #[serde(rename = "Bandwidth", deserialize_with = "lenient::number")]
    pub bandwidth: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionWeight {
    #[serde(rename = "Algorithm")]
    pub algorithm: String,
    #[serde(rename = "SessionID", deserialize_with = "lenient::string")]
    pub session_id: String,
    #[serde(rename = "Weight", deserialize_with = "lenient::number")]
    pub weight: f64,
}

#[derive(Deserialize)]
struct SessionName(#[serde(deserialize_with = "lenient::string")] String);

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A decoded control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    NodeOnline(NodeOnline),
    NodeOffline(NodeOffline),
    /// Opaque; forwarded to the session-ID allocator untouched.
    NewSession(serde_json::Value),
    /// Opaque; forwarded to the session-ID allocator untouched.
    QuerySessionId(serde_json::Value),
    RoutingInfo(RoutingInfo),
    /// A `RoutingInfo` frame without `Entry`: a node asking for its next
    /// hop. Opaque; forwarded to the routing service untouched.
    RoutingQuery(serde_json::Value),
    ReportRtt(Vec<RttSample>),
    ReportBandwidth(BandwidthReport),
    SessionSubscribed(String),
    SetSessionWeight(SessionWeight),
    /// A well-formed frame of a kind this controller does not know.
    Unknown { code: serde_json::Number, raw: String },
}

#[derive(Serialize)]
struct WireEnvelope<'a, T: Serialize> {
    #[serde(rename = "Type")]
    kind: u64,
    #[serde(rename = "Msg")]
    msg: &'a T,
}

impl ControlMessage {
    pub fn node_online(nodes: Vec<NodeIdentity>) -> Self {
        Self::NodeOnline(NodeOnline { new_node: nodes })
    }

    pub fn routing_info(session_id: impl Into<String>, next_hop: NodeId) -> Self {
        Self::RoutingInfo(RoutingInfo::next_hop(session_id, next_hop))
    }

    pub fn session_weight(algorithm: impl Into<String>, session_id: impl Into<String>, weight: f64) -> Self {
        Self::SetSessionWeight(SessionWeight {
            algorithm: algorithm.into(),
            session_id: session_id.into(),
            weight,
        })
    }

    /// The message kind, or `None` for [`ControlMessage::Unknown`].
    pub fn kind(&self) -> Option<MessageKind> {
        Some(match self {
            Self::NodeOnline(_) => MessageKind::NodeOnline,
            Self::NodeOffline(_) => MessageKind::NodeOffline,
            Self::NewSession(_) => MessageKind::NewSession,
            Self::QuerySessionId(_) => MessageKind::QuerySessionId,
            Self::RoutingInfo(_) | Self::RoutingQuery(_) => MessageKind::RoutingInfo,
            Self::ReportRtt(_) => MessageKind::ReportRtt,
            Self::ReportBandwidth(_) => MessageKind::ReportBandwidth,
            Self::SessionSubscribed(_) => MessageKind::SessionSubscribed,
            Self::SetSessionWeight(_) => MessageKind::SetSessionWeight,
            Self::Unknown { .. } => return None,
        })
    }

    /// Serialize to a single line of JSON without a trailing delimiter.
    pub fn encode(&self) -> Result<String, CodecError> {
        fn wrap<T: Serialize>(kind: MessageKind, msg: &T) -> Result<String, CodecError> {
            Ok(serde_json::to_string(&WireEnvelope {
                kind: kind.code(),
                msg,
            })?)
        }

        let text = match self {
            Self::NodeOnline(p) => wrap(MessageKind::NodeOnline, p)?,
            Self::NodeOffline(p) => wrap(MessageKind::NodeOffline, p)?,
            Self::NewSession(p) => wrap(MessageKind::NewSession, p)?,
            Self::QuerySessionId(p) => wrap(MessageKind::QuerySessionId, p)?,
            Self::RoutingInfo(p) => wrap(MessageKind::RoutingInfo, p)?,
            Self::RoutingQuery(p) => wrap(MessageKind::RoutingInfo, p)?,
            Self::ReportRtt(p) => wrap(MessageKind::ReportRtt, p)?,
            Self::ReportBandwidth(p) => wrap(MessageKind::ReportBandwidth, p)?,
            Self::SessionSubscribed(p) => wrap(MessageKind::SessionSubscribed, p)?,
            Self::SetSessionWeight(p) => wrap(MessageKind::SetSessionWeight, p)?,
            Self::Unknown { raw, .. } => raw.clone(),
        };

        if text.contains('\0') {
            return Err(CodecError::EmbeddedNul);
        }
        Ok(text)
    }

    /// Decode one frame (delimiter already stripped).
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(frame)?;
        let value: serde_json::Value = serde_json::from_str(text)?;
        let serde_json::Value::Object(mut envelope) = value else {
            return Err(CodecError::Malformed("frame is not a JSON object"));
        };

        let code = match envelope.get("Type") {
            Some(serde_json::Value::Number(n)) if n.is_i64() || n.is_u64() => n.clone(),
            Some(_) => return Err(CodecError::Malformed("Type is not an integer")),
            None => return Err(CodecError::Malformed("missing Type")),
        };
        let msg = envelope
            .remove("Msg")
            .ok_or(CodecError::Malformed("missing Msg"))?;

        let Some(kind) = code.as_u64().and_then(MessageKind::from_code) else {
            return Ok(Self::Unknown {
                code,
                raw: text.to_string(),
            });
        };

        let payload_err = |source| CodecError::Payload { kind, source };
        Ok(match kind {
            MessageKind::NodeOnline => Self::NodeOnline(serde_json::from_value(msg).map_err(payload_err)?),
            MessageKind::NodeOffline => Self::NodeOffline(serde_json::from_value(msg).map_err(payload_err)?),
            MessageKind::NewSession => Self::NewSession(msg),
            MessageKind::QuerySessionId => Self::QuerySessionId(msg),
            MessageKind::RoutingInfo if msg.get("Entry").is_none() => Self::RoutingQuery(msg),
            MessageKind::RoutingInfo => Self::RoutingInfo(serde_json::from_value(msg).map_err(payload_err)?),
            MessageKind::ReportRtt => Self::ReportRtt(serde_json::from_value(msg).map_err(payload_err)?),
            MessageKind::ReportBandwidth => {
                Self::ReportBandwidth(serde_json::from_value(msg).map_err(payload_err)?)
            }
            MessageKind::SessionSubscribed => {
                let SessionName(name) = serde_json::from_value(msg).map_err(payload_err)?;
                Self::SessionSubscribed(name)
            }
            MessageKind::SetSessionWeight => {
                Self::SetSessionWeight(serde_json::from_value(msg).map_err(payload_err)?)
            }
        })
    }
}

/// Deserializers that accept either a JSON number or a string.
pub(crate) mod lenient {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(serde_json::Number),
        Str(String),
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Repr::deserialize(d)? {
            Repr::Num(n) => n.to_string(),
            Repr::Str(s) => s,
        })
    }

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Num(n) => n
                .as_f64()
                .ok_or_else(|| serde::de::Error::custom(format!("number {n} is not representable"))),
            Repr::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("invalid number {s:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes() {
        for code in 1..=9 {
            assert_eq!(MessageKind::from_code(code).unwrap().code(), code);
        }
        assert!(MessageKind::from_code(0).is_none());
        assert!(MessageKind::from_code(10).is_none());
        assert_eq!(MessageKind::QuerySessionId.to_string(), "QuerySessionID");
    }

    #[test]
    fn test_encode_node_online() {
        let msg = ControlMessage::node_online(vec![NodeIdentity::new(2, "b"), NodeIdentity::new(3, "c")]);
        assert_eq!(
            msg.encode().unwrap(),
            r#"{"Type":1,"Msg":{"NewNode":[{"NodeID":2,"Hostname":"b"},{"NodeID":3,"Hostname":"c"}]}}"#
        );
    }

    #[test]
    fn test_encode_routing_info() {
        let msg = ControlMessage::routing_info("2-1-3", NodeId(1));
        assert_eq!(
            msg.encode().unwrap(),
            r#"{"Type":5,"Msg":{"SessionID":"2-1-3","Entry":[1],"Timeout":0}}"#
        );
    }

    #[test]
    fn test_encode_session_weight() {
        let msg = ControlMessage::session_weight("fair", "s.r.1", 1.5);
        assert_eq!(
            msg.encode().unwrap(),
            r#"{"Type":9,"Msg":{"Algorithm":"fair","SessionID":"s.r.1","Weight":1.5}}"#
        );
    }

    #[test]
    fn test_decode_report_rtt() {
        let frame = br#"{"Type":6,"Msg":[{"To":2,"OneWay":12.5},{"To":"3","OneWay":"4"}]}"#;
        let msg = ControlMessage::decode(frame).unwrap();
        assert_eq!(
            msg,
            ControlMessage::ReportRtt(vec![
                RttSample { to: NodeId(2), one_way: 12.5 },
                RttSample { to: NodeId(3), one_way: 4.0 },
            ])
        );
    }

    #[test]
    fn test_decode_bandwidth_and_subscription() {
        let bw = ControlMessage::decode(br#"{"Type":7,"Msg":{"From":4,"Bandwidth":950.25}}"#).unwrap();
        assert_eq!(
            bw,
            ControlMessage::ReportBandwidth(BandwidthReport { from: NodeId(4), bandwidth: 950.25 })
        );

        let sub = ControlMessage::decode(br#"{"Type":8,"Msg":"svc.regionA.7"}"#).unwrap();
        assert_eq!(sub, ControlMessage::SessionSubscribed("svc.regionA.7".to_string()));
    }

    #[test]
    fn test_decode_next_hop_query() {
        let msg = ControlMessage::decode(br#"{"Type":5,"Msg":{"SessionID":"abc","Hops":2}}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::RoutingQuery(serde_json::json!({"SessionID": "abc", "Hops": 2}))
        );
        assert_eq!(msg.kind(), Some(MessageKind::RoutingInfo));

        let msg = ControlMessage::decode(br#"{"Type":5,"Msg":{}}"#).unwrap();
        assert_eq!(msg, ControlMessage::RoutingQuery(serde_json::json!({})));
    }

    #[test]
    fn test_decode_opaque_payloads() {
        let msg = ControlMessage::decode(br#"{"Type":3,"Msg":{"src":1,"dsts":[2,3]}}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::NewSession(serde_json::json!({"src": 1, "dsts": [2, 3]}))
        );
        let msg = ControlMessage::decode(br#"{"Type":4,"Msg":{"anything":true}}"#).unwrap();
        assert_eq!(msg.kind(), Some(MessageKind::QuerySessionId));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let raw = r#"{"Type": 999, "Msg": {}}"#;
        let msg = ControlMessage::decode(raw.as_bytes()).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Unknown {
                code: 999.into(),
                raw: raw.to_string()
            }
        );
        assert!(msg.kind().is_none());

        let raw = r#"{"Type":-1,"Msg":null}"#;
        let msg = ControlMessage::decode(raw.as_bytes()).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Unknown {
                code: (-1).into(),
                raw: raw.to_string()
            }
        );
        assert!(matches!(ControlMessage::decode(br#"{"Type":0,"Msg":{}}"#), Ok(ControlMessage::Unknown { .. })));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            ControlMessage::decode(br#"{"Msg":{}}"#),
            Err(CodecError::Malformed("missing Type"))
        ));
        assert!(matches!(
            ControlMessage::decode(br#"{"Type":1}"#),
            Err(CodecError::Malformed("missing Msg"))
        ));
        assert!(matches!(
            ControlMessage::decode(br#"{"Type":"one","Msg":{}}"#),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            ControlMessage::decode(br#"{"Type":5.5,"Msg":{}}"#),
            Err(CodecError::Malformed("Type is not an integer"))
        ));
        assert!(matches!(ControlMessage::decode(b"[1,2]"), Err(CodecError::Malformed(_))));
        assert!(matches!(ControlMessage::decode(b"{not json"), Err(CodecError::Json(_))));
        assert!(matches!(ControlMessage::decode(&[0xff, 0xfe]), Err(CodecError::Utf8(_))));
    }

    #[test]
    fn test_decode_bad_payload_names_kind() {
        let err = ControlMessage::decode(br#"{"Type":7,"Msg":{"From":"x"}}"#).unwrap_err();
        match err {
            CodecError::Payload { kind, .. } => assert_eq!(kind, MessageKind::ReportBandwidth),
            other => panic!("expected payload error, got {other:?}"),
        }
    }

    #[test]
    fn test_encoded_routing_info_decodes() {
        let original = ControlMessage::routing_info("7", NodeId(7));
        let decoded = ControlMessage::decode(original.encode().unwrap().as_bytes()).unwrap();
        assert_eq!(decoded, original);
    }
}
