use ruck_session_engine::{ConfigError, StartError, StoreError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuckdError {
    #[error("Failed to read replay file {path}: {source}")]
    ReadReplay {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid replay file {path}: {source}")]
    ParseReplay {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Replay file {0} contains no samples")]
    EmptyReplay(PathBuf),

    #[error("A session is already in progress ({0}); run `ruckd clear` first")]
    SessionInProgress(String),

    #[error("Session did not start: {0}")]
    Start(#[from] StartError),

    #[error("Session did not complete within {0} simulated seconds")]
    CompletionStalled(i64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write output: {0}")]
    Output(#[from] serde_json::Error),
}
