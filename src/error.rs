//! Error taxonomy shared by the selector, the bus client and the art cache.
//!
//! None of these are fatal to the daemon: the hub reports them to clients and
//! keeps evaluating on the next trigger.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The bus has no endpoint under the media-player namespace.
    #[error("no players found")]
    NoPlayers,

    /// An explicit player reference matched neither a bus name nor an identity.
    #[error("player {0:?} not found")]
    NotFound(String),

    #[error("call {method}: {detail}")]
    Control { method: &'static str, detail: String },

    #[error("track ID is required for absolute seek")]
    MissingTrackId,

    #[error("invalid cache key")]
    InvalidKey,

    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("bus call timed out after {0:?}")]
    Timeout(Duration),

    #[error("session bus: {0}")]
    Bus(#[from] zbus::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub(crate) fn control(method: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Control {
            method,
            detail: err.to_string(),
        }
    }

    /// Selection failures are the caller's fault; everything else is ours.
    #[must_use]
    pub const fn is_selection(&self) -> bool {
        matches!(
            self,
            Self::NoPlayers | Self::NotFound(_) | Self::InvalidRequest(_)
        )
    }
}

pub type Result<T, E = RemoteError> = std::result::Result<T, E>;
