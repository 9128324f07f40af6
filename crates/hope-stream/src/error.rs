//! Error types for hope-stream

use thiserror::Error;

use crate::connector::ConnectorError;
use crate::session::SessionStatus;

/// Result type alias using the streaming error type
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors raised while serving a question
#[derive(Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Core(#[from] hope_core::Error),

    #[error("Generation failed: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Session already registered: {0}")]
    DuplicateSession(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {id} is closed ({status})")]
    SessionClosed { id: String, status: SessionStatus },
}

impl StreamError {
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::SessionNotFound(id.into())
    }

    pub fn session_closed(id: impl Into<String>, status: SessionStatus) -> Self {
        Self::SessionClosed {
            id: id.into(),
            status,
        }
    }

    pub fn is_session_closed(&self) -> bool {
        matches!(self, Self::SessionClosed { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_))
    }
}
