//! hope-stream - dual-track answer streaming
//!
//! Runs a fast cache lookup and a generative stream side by side for every
//! question, and decides what a finished session leaves behind:
//!
//! - **connector**: the generative model interface (one-shot and streaming)
//! - **session**: per-question state machine and bounded subscriber fan-out
//! - **monitor**: session registry, draft retention, write-back, timeout sweep
//! - **orchestrator**: the per-question entry point wiring the two tracks

pub mod connector;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod session;

// Re-export commonly used types
pub use connector::{ChunkStream, ConnectorError, GenerationStream, GenerativeConnector};
pub use error::{Result, StreamError};
pub use monitor::{Draft, DraftReason, InterruptOutcome, MonitorStats, SessionMonitor};
pub use orchestrator::{AskHandle, AskRequest, StreamingOrchestrator};
pub use session::{SessionSnapshot, SessionStatus, StreamEvent, StreamingSession, Subscription};
