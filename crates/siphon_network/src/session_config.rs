//! Static session configuration held in the shared store.
//!
//! The configuration is a JSON document stored verbatim under
//! [`keys::CONFIGURATION`]. Only the `PseudoSessions` list is interpreted;
//! any other top-level fields are preserved in the store but ignored here.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::NetworkError;
use crate::identity::NodeId;
use crate::message::lenient;
use crate::store::{CommandStore, StoreError, keys};

/// A statically configured multi-hop session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PseudoSession {
    #[serde(rename = "SessionID", deserialize_with = "lenient::string")]
    pub session_id: String,
    /// Ordered hops. A session without a path is never installed.
    #[serde(rename = "Path", default)]
    pub path: Vec<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(rename = "PseudoSessions", default)]
    pub pseudo_sessions: Vec<PseudoSession>,
}

impl SessionConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Read the JSON file at `path` and store it under `Configuration`.
///
/// The file must be valid JSON; its compact form is what gets stored.
pub async fn load_into_store(path: &Path, store: &dyn CommandStore) -> Result<(), NetworkError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| NetworkError::Config(format!("cannot read {}: {e}", path.display())))?;
    let document: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| NetworkError::Config(format!("invalid JSON in {}: {e}", path.display())))?;
    let compact = serde_json::to_string(&document)
        .map_err(|e| NetworkError::Config(e.to_string()))?;

    store.set(keys::CONFIGURATION, &compact).await?;
    info!(path = %path.display(), "loaded session configuration into store");
    Ok(())
}

/// Fetch the current session configuration.
///
/// A missing or unparsable document yields an empty configuration; only a
/// store failure is reported as an error.
pub async fn fetch(store: &dyn CommandStore) -> Result<SessionConfig, StoreError> {
    let Some(text) = store.get(keys::CONFIGURATION).await? else {
        return Ok(SessionConfig::default());
    };
    match SessionConfig::from_json(&text) {
        Ok(config) => Ok(config),
        Err(e) => {
            warn!("ignoring corrupt session configuration: {e}");
            Ok(SessionConfig::default())
        }
    }
}
