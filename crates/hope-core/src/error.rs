//! Error Types
//!
//! Defines error types for the knowledge cache.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Knowledge cache errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigValidationError),

    /// Snapshot file could not be read or written
    #[error("persistence error at {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot file exists but does not decode
    #[error("corrupt snapshot {}: {source}", path.display())]
    CorruptSnapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Match pattern does not compile
    #[error("invalid pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    /// Entry not found
    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: String, id: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a persistence error
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Create an invalid pattern error
    pub fn invalid_pattern(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error came from the snapshot layer
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence { .. } | Self::CorruptSnapshot { .. })
    }
}
