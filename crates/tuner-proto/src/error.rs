//! Error taxonomy shared by the controller, the engine and the HTTP boundary.

use thiserror::Error;

/// Every failure a `submit` or a catalog mutation can report to its caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RadioError {
    /// Bad input shape or range, rejected before entering the queue.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Unknown pack or station id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The station URL could not be turned into a playable source.
    #[error("could not resolve source: {0}")]
    Resolution(String),

    /// The playback subprocess could not be started (or timed out starting).
    #[error("could not launch playback: {0}")]
    Launch(String),

    /// Output hardware or mixer unavailable.
    #[error("audio device error: {0}")]
    Device(String),

    /// Writing packs or settings failed; in-memory state was left untouched.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The controller loop is gone (shutdown in progress).
    #[error("controller unavailable")]
    Unavailable,
}

impl RadioError {
    pub fn pack_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "pack",
            id: id.into(),
        }
    }

    pub fn station_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "station",
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RadioError>;
