use std::time::Duration;

use thiserror::Error;

/// Errors produced by the podsh protocol layer.
///
/// Session and protocol failures are distinct variants so callers can tell
/// them apart from a remote command that merely failed (which shows up in the
/// captured stderr, not here).
#[derive(Debug, Error)]
pub enum PodshError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("a command is already in progress on this session")]
    CommandInProgress,

    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("protocol upgrade failed: {0}")]
    ProtocolUpgradeFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid status message: {0}")]
    Status(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for PodshError {
    fn from(e: serde_json::Error) -> Self {
        PodshError::Status(e.to_string())
    }
}

pub type PodshResult<T> = Result<T, PodshError>;
