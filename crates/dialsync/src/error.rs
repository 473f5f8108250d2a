//! Error types for dialsync.
//!
//! Nothing here is fatal: every failure path degrades to "state may be stale
//! until the next successful dispatch or push".

use std::path::PathBuf;

use crate::engine::Channel;

/// Failures reported by a [`crate::engine::RemoteHub`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HubError {
    #[error("hub is not connected")]
    NotConnected,

    #[error("hub rejected command: {0}")]
    Rejected(String),

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Failures of a single dispatch attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// Normal UI gating; logged, never surfaced to the user.
    #[error("channel {0} is not supported by this entity")]
    CapabilityDenied(Channel),

    #[error("hub is not connected")]
    NotConnected,

    #[error("hub did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl DispatchError {
    /// Whether this failure should be reported upward to the UI.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, DispatchError::CapabilityDenied(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}
