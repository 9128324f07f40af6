//! Generative model connector.
//!
//! The orchestrator only needs a one-shot `generate`, a streaming
//! `generate_stream` producing a finite, non-restartable sequence of text
//! chunks, and a capability check telling which one to use.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Upstream failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("generation error: {0}")]
    Generation(String),

    #[error("streaming is not supported by this connector")]
    StreamingUnsupported,

    #[error("generator unavailable: {0}")]
    Unavailable(String),
}

/// Chunks of generated text, ending at completion or the first error
pub type ChunkStream = BoxStream<'static, Result<String, ConnectorError>>;

/// A started streaming generation
pub struct GenerationStream {
    pub chunks: ChunkStream,
    /// Total chunk count, when the upstream announces it
    pub expected_chunks: Option<u32>,
}

impl GenerationStream {
    pub fn new(chunks: ChunkStream) -> Self {
        Self {
            chunks,
            expected_chunks: None,
        }
    }

    pub fn with_expected_chunks(mut self, expected: u32) -> Self {
        self.expected_chunks = Some(expected);
        self
    }
}

impl std::fmt::Debug for GenerationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationStream")
            .field("expected_chunks", &self.expected_chunks)
            .finish_non_exhaustive()
    }
}

/// A generative model backend.
#[async_trait]
pub trait GenerativeConnector: Send + Sync {
    /// Generate a complete answer.
    async fn generate(&self, prompt: &str) -> Result<String, ConnectorError>;

    /// Start a streaming generation.
    async fn generate_stream(&self, _prompt: &str) -> Result<GenerationStream, ConnectorError> {
        Err(ConnectorError::StreamingUnsupported)
    }

    fn supports_streaming(&self) -> bool;
}
