//! Error taxonomy.
//!
//! Every fallible verb returns `Result<T, EngineError>` and, on failure,
//! emits the same error via [`crate::event_bus::EngineEvent::Error`]. Errors
//! never leak backtraces; `details` is a structured, loggable payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    MediaNotSupported,
    MediaLoadFailed,
    DecodeError,
    NetworkError,
    PermissionDenied,
    PlaybackError,
    TrackNotFound,
    InvalidState,
    OperationAborted,
}

impl ErrorKind {
    /// Whether the engine (or the caller, on a user gesture) can recover
    /// without a fresh `load`.
    pub fn is_recoverable(self) -> bool {
        !matches!(
            self,
            ErrorKind::MediaNotSupported | ErrorKind::MediaLoadFailed | ErrorKind::DecodeError
        )
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl PartialEq for EngineError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn track_not_found(id: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::TrackNotFound, format!("track not found: {id}"))
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OperationAborted, message)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
