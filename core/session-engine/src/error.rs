//! Error types for the session engine.
//!
//! Only `StartError` (and an explicit discard) ends a session from the
//! caller's point of view. Ingestion, delivery and companion errors are
//! absorbed by the controller and reflected as degraded status.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StartError {
    #[error("a session is already active")]
    AlreadyActive,

    #[error("network error while creating session: {0}")]
    Network(String),

    #[error("not authorized to create a session")]
    Unauthorized,

    #[error("invalid session parameters: {0}")]
    Validation(String),

    #[error("timed out waiting for session creation")]
    Timeout,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Component faults (absorbed, non-fatal)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum IngestionFault {
    #[error("sensor permission denied: {0}")]
    PermissionDenied(String),

    #[error("sensor hardware unavailable: {0}")]
    HardwareUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DeliveryError {
    #[error("network error during delivery: {0}")]
    Network(String),

    #[error("server rejected delivery: {0}")]
    ServerRejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CompanionError {
    #[error("companion device not reachable")]
    NotReachable,

    #[error("companion data is stale")]
    Stale,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Local infrastructure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session store error: {context}: {source}")]
    Sqlite {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("snapshot encoding error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

impl StoreError {
    pub(crate) fn sqlite(context: &str, source: rusqlite::Error) -> Self {
        StoreError::Sqlite {
            context: context.to_string(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("home directory not found")]
    HomeNotFound,

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
