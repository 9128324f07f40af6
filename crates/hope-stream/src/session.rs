//! Streaming session state machine and subscriber fan-out.
//!
//! ```text
//!   CREATED ──► STREAMING ──┬──► COMPLETED
//!      │                    ├──► INTERRUPTED
//!      └────────────────────┴──► ERROR
//! ```
//!
//! Terminal states are sinks: the first terminal transition wins, later
//! ones return `false`, and no chunk is accepted afterwards. Chunks are
//! fanned out to bounded per-subscriber channels in emission order. The
//! subscriber registry is locked only to copy senders, so attaching and
//! detaching never wait behind a publisher blocked on a slow subscriber.
//! Interruption and errors fire a cancel signal the generation task
//! watches.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use chrono::{DateTime, Duration, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use hope_core::{BackpressurePolicy, SharedClock, StreamingConfig};

use crate::error::{Result, StreamError};

/// Lifecycle status of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Streaming,
    Completed,
    Interrupted,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Interrupted | Self::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Generated text, `index` counting from 0
    Chunk { index: u32, text: String },
    Completed { chunks: u32 },
    Interrupted { reason: String },
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk { .. })
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub question: String,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub status: SessionStatus,
    pub chunks_received: u32,
    pub expected_chunks: Option<u32>,
    pub answer: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub interrupt_reason: Option<String>,
    pub error: Option<String>,
    pub saved_to_cache: bool,
    pub dropped_chunks: u64,
}

impl SessionSnapshot {
    /// Time from start to the terminal transition, or to `now` while live
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        self.completed_at.unwrap_or(now) - self.started_at
    }

    pub fn answer_chars(&self) -> usize {
        self.answer.chars().count()
    }
}

enum Terminal {
    Completed,
    Interrupted(String),
    Error(String),
}

struct SessionState {
    status: SessionStatus,
    chunks_received: u32,
    expected_chunks: Option<u32>,
    answer: String,
    completed_at: Option<DateTime<Utc>>,
    interrupt_reason: Option<String>,
    error: Option<String>,
    saved_to_cache: bool,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StreamEvent>,
    /// Set on unsubscribe; releases a publisher blocked on this channel
    detached: watch::Sender<bool>,
}

/// Resolves once the subscriber is detached or its registry entry is dropped.
async fn detached(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|detached| *detached).await;
}

/// A subscriber's view of a session's events.
///
/// Ends after the terminal event. Only events published after
/// subscribing are seen.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    session_id: String,
    events: ReceiverStream<StreamEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        futures::StreamExt::next(&mut self.events).await
    }

    /// Drain to the end, returning the concatenated text and the terminal event.
    pub async fn collect_answer(mut self) -> (String, Option<StreamEvent>) {
        let mut answer = String::new();
        while let Some(event) = self.recv().await {
            match event {
                StreamEvent::Chunk { text, .. } => answer.push_str(&text),
                terminal => return (answer, Some(terminal)),
            }
        }
        (answer, None)
    }
}

impl Stream for Subscription {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

/// One question's generation, from request to terminal state
pub struct StreamingSession {
    id: String,
    question: String,
    user_id: Option<String>,
    conversation_id: Option<String>,
    started_at: DateTime<Utc>,
    clock: SharedClock,
    buffer: usize,
    policy: BackpressurePolicy,
    state: Mutex<SessionState>,
    subscribers: Mutex<Vec<Subscriber>>,
    /// Serializes publishing so events keep their order
    publish: AsyncMutex<()>,
    next_subscriber: AtomicU64,
    dropped_chunks: AtomicU64,
    cancel: watch::Sender<bool>,
}

impl StreamingSession {
    pub fn new(
        id: impl Into<String>,
        question: impl Into<String>,
        clock: SharedClock,
        config: &StreamingConfig,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            id: id.into(),
            question: question.into(),
            user_id: None,
            conversation_id: None,
            started_at: clock.now(),
            clock,
            buffer: config.subscriber_buffer.max(1),
            policy: config.backpressure,
            state: Mutex::new(SessionState {
                status: SessionStatus::Created,
                chunks_received: 0,
                expected_chunks: None,
                answer: String::new(),
                completed_at: None,
                interrupt_reason: None,
                error: None,
                saved_to_cache: false,
            }),
            subscribers: Mutex::new(Vec::new()),
            publish: AsyncMutex::new(()),
            next_subscriber: AtomicU64::new(1),
            dropped_chunks: AtomicU64::new(0),
            cancel,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Conversation the question belongs to, for session context updates
    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn status(&self) -> SessionStatus {
        self.state().status
    }

    pub fn answer(&self) -> String {
        self.state().answer.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        SessionSnapshot {
            id: self.id.clone(),
            question: self.question.clone(),
            user_id: self.user_id.clone(),
            conversation_id: self.conversation_id.clone(),
            status: state.status,
            chunks_received: state.chunks_received,
            expected_chunks: state.expected_chunks,
            answer: state.answer.clone(),
            started_at: self.started_at,
            completed_at: state.completed_at,
            interrupt_reason: state.interrupt_reason.clone(),
            error: state.error.clone(),
            saved_to_cache: state.saved_to_cache,
            dropped_chunks: self.dropped_chunks.load(Ordering::Relaxed),
        }
    }

    /// Time since start, frozen at the terminal transition.
    pub fn duration(&self) -> Duration {
        let completed_at = self.state().completed_at;
        completed_at.unwrap_or_else(|| self.clock.now()) - self.started_at
    }

    /// CREATED → STREAMING. Returns false from any other state.
    pub fn start(&self) -> bool {
        let mut state = self.state();
        if state.status != SessionStatus::Created {
            return false;
        }
        state.status = SessionStatus::Streaming;
        true
    }

    pub fn set_expected_chunks(&self, expected: u32) {
        self.state().expected_chunks = Some(expected);
    }

    /// Claim the one cache write for this session.
    pub fn mark_saved(&self) -> bool {
        let mut state = self.state();
        !std::mem::replace(&mut state.saved_to_cache, true)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subscribers
    // ─────────────────────────────────────────────────────────────────────

    /// Attach a subscriber. Fails once the session is terminal.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let mut subscribers = self.subscribers();
        let status = self.status();
        if status.is_terminal() {
            return Err(StreamError::session_closed(&self.id, status));
        }
        let (tx, rx) = mpsc::channel(self.buffer);
        let (detached, _) = watch::channel(false);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        subscribers.push(Subscriber { id, tx, detached });
        debug!(session_id = %self.id, subscriber_id = id, "Subscriber attached");
        Ok(Subscription {
            id,
            session_id: self.id.clone(),
            events: ReceiverStream::new(rx),
        })
    }

    pub async fn unsubscribe(&self, subscriber_id: u64) -> bool {
        let mut subscribers = self.subscribers();
        let Some(position) = subscribers.iter().position(|s| s.id == subscriber_id) else {
            return false;
        };
        let subscriber = subscribers.remove(position);
        subscriber.detached.send_replace(true);
        debug!(session_id = %self.id, subscriber_id, "Subscriber detached");
        true
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Chunks
    // ─────────────────────────────────────────────────────────────────────

    /// Append a chunk to the answer and deliver it to every subscriber.
    ///
    /// Returns the chunk index, or `SessionClosed` once terminal.
    pub async fn publish_chunk(&self, text: impl Into<String>) -> Result<u32> {
        let text = text.into();
        let _publishing = self.publish.lock().await;
        let index = {
            let mut state = self.state();
            if state.status.is_terminal() {
                return Err(StreamError::session_closed(&self.id, state.status));
            }
            state.status = SessionStatus::Streaming;
            state.answer.push_str(&text);
            let index = state.chunks_received;
            state.chunks_received += 1;
            index
        };

        let event = StreamEvent::Chunk { index, text };
        let targets: Vec<_> = self
            .subscribers()
            .iter()
            .map(|s| (s.id, s.tx.clone(), s.detached.subscribe()))
            .collect();

        let mut closed = Vec::new();
        for (subscriber_id, tx, detach) in targets {
            match self.policy {
                BackpressurePolicy::Block => {
                    let sent = tokio::select! {
                        biased;
                        _ = self.cancelled() => None,
                        _ = detached(detach) => Some(true),
                        sent = tx.send(event.clone()) => Some(sent.is_ok()),
                    };
                    match sent {
                        Some(true) => {}
                        Some(false) => closed.push(subscriber_id),
                        None => break,
                    }
                }
                BackpressurePolicy::Drop => match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.dropped_chunks.fetch_add(1, Ordering::Relaxed);
                        debug!(session_id = %self.id, subscriber_id, index, "Dropped chunk for slow subscriber");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(subscriber_id),
                },
            }
        }
        if !closed.is_empty() {
            self.subscribers().retain(|s| {
                let gone = closed.contains(&s.id);
                if gone {
                    debug!(session_id = %self.id, subscriber_id = s.id, "Pruned closed subscriber");
                }
                !gone
            });
        }
        Ok(index)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Terminal transitions
    // ─────────────────────────────────────────────────────────────────────

    /// Mark the session completed. Returns whether this call made the transition.
    pub async fn complete(&self) -> bool {
        self.finish(Terminal::Completed).await
    }

    pub async fn interrupt(&self, reason: impl Into<String>) -> bool {
        self.finish(Terminal::Interrupted(reason.into())).await
    }

    pub async fn fail(&self, message: impl Into<String>) -> bool {
        self.finish(Terminal::Error(message.into())).await
    }

    async fn finish(&self, terminal: Terminal) -> bool {
        let (event, cancel) = {
            let mut state = self.state();
            if state.status.is_terminal() {
                debug!(session_id = %self.id, status = %state.status, "Session already finished");
                return false;
            }
            state.completed_at = Some(self.clock.now());
            match terminal {
                Terminal::Completed => {
                    state.status = SessionStatus::Completed;
                    (StreamEvent::Completed { chunks: state.chunks_received }, false)
                }
                Terminal::Interrupted(reason) => {
                    state.status = SessionStatus::Interrupted;
                    state.interrupt_reason = Some(reason.clone());
                    (StreamEvent::Interrupted { reason }, true)
                }
                Terminal::Error(message) => {
                    state.status = SessionStatus::Error;
                    state.error = Some(message.clone());
                    (StreamEvent::Error { message }, true)
                }
            }
        };
        if cancel {
            self.cancel.send_replace(true);
        }

        // Terminal events are never dropped: a full channel gets the event
        // from a task that waits for room.
        let _publishing = self.publish.lock().await;
        let subscribers = std::mem::take(&mut *self.subscribers());
        for subscriber in subscribers {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(event)) => {
                    let session_id = self.id.clone();
                    tokio::spawn(async move {
                        if subscriber.tx.send(event).await.is_err() {
                            warn!(session_id = %session_id, subscriber_id = subscriber.id, "Subscriber gone before terminal event");
                        }
                    });
                }
            }
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cancellation
    // ─────────────────────────────────────────────────────────────────────

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the session is interrupted or fails.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl std::fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSession")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
