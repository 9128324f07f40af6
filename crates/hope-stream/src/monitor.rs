//! SessionMonitor: registry and lifecycle policy for streaming sessions.
//!
//! The monitor is the single source of truth for session status. It
//! decides what happens when a session ends:
//!
//! - **completed**: a valid answer is written to the ordinary tier once,
//!   unrated, off the request path
//! - **interrupted** (client disconnect or sweep timeout): kept as a draft
//!   when mostly complete or long and dwelled on, otherwise discarded
//! - **error**: never cached
//!
//! A periodic sweep interrupts sessions that outlive the timeout and
//! forgets finished ones.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use hope_core::{CachedQA, MonitorConfig, OrdinaryTier, SharedClock};

use crate::error::{Result, StreamError};
use crate::session::{SessionSnapshot, StreamingSession, Subscription};

const TIMEOUT_REASON: &str = "timeout";

/// Why a partial answer was kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftReason {
    /// Most of the expected chunks arrived
    MostlyComplete,
    /// Long answer the user stayed with for a while
    LongAndDwelled,
}

/// A partial answer kept after an interruption
#[derive(Debug, Clone, Serialize)]
pub struct Draft {
    pub session_id: String,
    pub question: String,
    pub partial_answer: String,
    pub chunks_received: u32,
    pub expected_chunks: Option<u32>,
    pub interrupt_reason: Option<String>,
    pub reason: DraftReason,
    pub started_at: DateTime<Utc>,
}

/// What an interruption did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptOutcome {
    DraftRetained(DraftReason),
    Discarded,
    /// The session had already finished
    AlreadyFinished,
}

/// Monitor counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStats {
    pub active_sessions: usize,
    pub tracked_sessions: usize,
    pub drafts: usize,
}

/// Registry of live streaming sessions
pub struct SessionMonitor {
    config: MonitorConfig,
    clock: SharedClock,
    sessions: DashMap<String, Arc<StreamingSession>>,
    drafts: Mutex<VecDeque<Draft>>,
    /// None when the knowledge cache is disabled
    cache: Option<Arc<OrdinaryTier>>,
    pending_writes: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionMonitor {
    pub fn new(config: MonitorConfig, clock: SharedClock, cache: Option<Arc<OrdinaryTier>>) -> Self {
        Self {
            config,
            clock,
            sessions: DashMap::new(),
            drafts: Mutex::new(VecDeque::new()),
            cache,
            pending_writes: Mutex::new(Vec::new()),
        }
    }

    fn drafts_lock(&self) -> MutexGuard<'_, VecDeque<Draft>> {
        self.drafts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────────────────────────

    /// Track a session. A live session with the same id is an error; a
    /// finished one is replaced.
    pub fn register(&self, session: Arc<StreamingSession>) -> Result<()> {
        match self.sessions.entry(session.id().to_string()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().status().is_terminal() {
                    return Err(StreamError::DuplicateSession(session.id().to_string()));
                }
                existing.insert(session);
            }
            Entry::Vacant(slot) => {
                slot.insert(session);
            }
        }
        debug!(active = self.sessions.len(), "Session registered");
        Ok(())
    }

    pub fn unregister(&self, session_id: &str) -> Option<Arc<StreamingSession>> {
        self.sessions.remove(session_id).map(|(_, session)| session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<StreamingSession>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    fn require(&self, session_id: &str) -> Result<Arc<StreamingSession>> {
        self.get(session_id)
            .ok_or_else(|| StreamError::session_not_found(session_id))
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.get(session_id).map(|s| s.snapshot())
    }

    /// Sessions that have not reached a terminal state
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| !s.status().is_terminal())
            .count()
    }

    pub async fn subscribe(&self, session_id: &str) -> Result<Subscription> {
        self.require(session_id)?.subscribe().await
    }

    pub async fn unsubscribe(&self, session_id: &str, subscriber_id: u64) -> Result<bool> {
        Ok(self.require(session_id)?.unsubscribe(subscriber_id).await)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Terminal events
    // ─────────────────────────────────────────────────────────────────────

    /// Complete a session and cache its answer when valid.
    ///
    /// Returns whether this call completed the session.
    pub async fn complete(&self, session_id: &str) -> Result<bool> {
        let session = self.require(session_id)?;
        if !session.complete().await {
            return Ok(false);
        }
        let snapshot = session.snapshot();
        info!(
            session_id = %session_id,
            chunks = snapshot.chunks_received,
            duration_ms = snapshot.duration(self.clock.now()).num_milliseconds(),
            "Session completed"
        );
        self.cache_answer(&session, &snapshot);
        Ok(true)
    }

    /// Fail a session. Failed sessions are never cached.
    pub async fn fail(&self, session_id: &str, message: &str) -> Result<bool> {
        let session = self.require(session_id)?;
        let won = session.fail(message).await;
        if won {
            error!(session_id = %session_id, error = %message, "Session failed");
        }
        Ok(won)
    }

    /// Interrupt a session whose client went away and apply the draft policy.
    pub async fn on_client_disconnect(&self, session_id: &str, reason: &str) -> Result<InterruptOutcome> {
        let session = self.require(session_id)?;
        Ok(self.interrupt(&session, reason).await)
    }

    async fn interrupt(&self, session: &StreamingSession, reason: &str) -> InterruptOutcome {
        if !session.interrupt(reason).await {
            return InterruptOutcome::AlreadyFinished;
        }
        let snapshot = session.snapshot();
        warn!(
            session_id = %snapshot.id,
            reason = %reason,
            chunks = snapshot.chunks_received,
            expected = ?snapshot.expected_chunks,
            "Session interrupted"
        );

        match self.draft_reason(&snapshot) {
            Some(draft_reason) => {
                info!(session_id = %snapshot.id, reason = ?draft_reason, "Draft retained");
                self.push_draft(Draft {
                    session_id: snapshot.id.clone(),
                    question: snapshot.question.clone(),
                    partial_answer: snapshot.answer.clone(),
                    chunks_received: snapshot.chunks_received,
                    expected_chunks: snapshot.expected_chunks,
                    interrupt_reason: snapshot.interrupt_reason.clone(),
                    reason: draft_reason,
                    started_at: snapshot.started_at,
                });
                InterruptOutcome::DraftRetained(draft_reason)
            }
            None => {
                info!(session_id = %snapshot.id, "Discarded incomplete session");
                InterruptOutcome::Discarded
            }
        }
    }

    /// Draft policy, first rule that applies.
    fn draft_reason(&self, snapshot: &SessionSnapshot) -> Option<DraftReason> {
        if let Some(expected) = snapshot.expected_chunks.filter(|n| *n > 0) {
            if f64::from(snapshot.chunks_received) >= self.config.mostly_complete_ratio * f64::from(expected) {
                return Some(DraftReason::MostlyComplete);
            }
        }
        let duration = snapshot.duration(self.clock.now());
        if snapshot.answer_chars() > self.config.long_answer_chars
            && duration > Duration::seconds(self.config.dwell_secs)
        {
            return Some(DraftReason::LongAndDwelled);
        }
        None
    }

    fn push_draft(&self, draft: Draft) {
        let capacity = self.config.draft_capacity.max(1);
        let mut drafts = self.drafts_lock();
        drafts.push_back(draft);
        while drafts.len() > capacity {
            drafts.pop_front();
        }
    }

    /// Kept drafts, oldest first.
    pub fn drafts(&self) -> Vec<Draft> {
        self.drafts_lock().iter().cloned().collect()
    }

    fn is_cacheable(&self, snapshot: &SessionSnapshot) -> bool {
        snapshot.answer_chars() >= self.config.min_answer_length
            && snapshot.duration(self.clock.now()) >= Duration::seconds(self.config.min_duration_secs)
    }

    fn cache_answer(&self, session: &StreamingSession, snapshot: &SessionSnapshot) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        if !self.is_cacheable(snapshot) {
            debug!(
                session_id = %snapshot.id,
                answer_chars = snapshot.answer_chars(),
                "Answer too short or too quick to cache"
            );
            return;
        }
        if !session.mark_saved() {
            debug!(session_id = %snapshot.id, "Answer already cached");
            return;
        }

        let entry = CachedQA::new(&snapshot.question, &snapshot.answer, self.clock.now())
            .with_session(&snapshot.id);
        let session_id = snapshot.id.clone();
        let handle = tokio::task::spawn_blocking(move || {
            cache.insert(entry);
            info!(session_id = %session_id, "Cached completed answer");
        });
        self.pending_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Wait for every cache write started so far.
    pub async fn wait_for_cache_writes(&self) {
        let handles = std::mem::take(&mut *self.pending_writes.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Cache write task failed");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sweep
    // ─────────────────────────────────────────────────────────────────────

    /// Interrupt sessions older than the timeout and forget finished ones.
    ///
    /// Returns the number of sessions interrupted.
    pub async fn sweep(&self) -> usize {
        let timeout = Duration::seconds(self.config.session_timeout_secs);
        let sessions: Vec<Arc<StreamingSession>> = self.sessions.iter().map(|s| s.clone()).collect();

        let mut interrupted = 0;
        for session in &sessions {
            if session.status().is_terminal() || session.duration() <= timeout {
                continue;
            }
            if self.interrupt(session, TIMEOUT_REASON).await != InterruptOutcome::AlreadyFinished {
                interrupted += 1;
            }
        }

        self.sessions.retain(|_, s| !s.status().is_terminal());
        self.pending_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|h| !h.is_finished());

        if interrupted > 0 {
            warn!(interrupted, "Interrupted timed out sessions");
        }
        interrupted
    }

    /// Sweep every `sweep_interval_secs` until aborted.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let period = std::time::Duration::from_secs(self.config.sweep_interval_secs.max(1));
        info!(interval_secs = period.as_secs(), "Starting session sweep");
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }

    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            active_sessions: self.active_count(),
            tracked_sessions: self.sessions.len(),
            drafts: self.drafts_lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hope_core::{ManualClock, OrdinaryConfig, StreamingConfig};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        clock: ManualClock,
        cache: Arc<OrdinaryTier>,
        monitor: Arc<SessionMonitor>,
    }

    fn fixture() -> Fixture {
        fixture_with(MonitorConfig::default())
    }

    fn fixture_with(config: MonitorConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let cache = Arc::new(OrdinaryTier::open(
            OrdinaryConfig {
                storage_path: dir.path().to_path_buf(),
                ..OrdinaryConfig::default()
            },
            clock.shared(),
        ));
        let monitor = Arc::new(SessionMonitor::new(config, clock.shared(), Some(cache.clone())));
        Fixture {
            _dir: dir,
            clock,
            cache,
            monitor,
        }
    }

    fn register(f: &Fixture, id: &str, question: &str) -> Arc<StreamingSession> {
        let session = Arc::new(StreamingSession::new(
            id,
            question,
            f.clock.shared(),
            &StreamingConfig::default(),
        ));
        f.monitor.register(session.clone()).unwrap();
        session
    }

    // ─────────────────────────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_duplicate_live_session_rejected() {
        let f = fixture();
        let first = register(&f, "s1", "q");

        let again = Arc::new(StreamingSession::new("s1", "q", f.clock.shared(), &StreamingConfig::default()));
        let err = f.monitor.register(again.clone()).unwrap_err();
        assert!(matches!(err, StreamError::DuplicateSession(id) if id == "s1"));

        first.complete().await;
        f.monitor.register(again).unwrap();
        assert_eq!(f.monitor.active_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session_errors() {
        let f = fixture();
        assert!(f.monitor.subscribe("nope").await.unwrap_err().is_not_found());
        assert!(f.monitor.complete("nope").await.unwrap_err().is_not_found());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Interruption policy
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_mostly_complete_session_becomes_draft() {
        let f = fixture();
        let session = register(&f, "s1", "How do I shard a dashmap?");
        session.set_expected_chunks(10);
        for i in 0..9 {
            session.publish_chunk(format!("part {i} ")).await.unwrap();
        }

        let outcome = f.monitor.on_client_disconnect("s1", "client closed").await.unwrap();
        assert_eq!(outcome, InterruptOutcome::DraftRetained(DraftReason::MostlyComplete));
        let drafts = f.monitor.drafts();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].chunks_received, 9);
        assert_eq!(drafts[0].interrupt_reason.as_deref(), Some("client closed"));
    }

    #[tokio::test]
    async fn test_short_quick_session_discarded() {
        let f = fixture();
        let session = register(&f, "s1", "What is a span?");
        session.publish_chunk("x".repeat(50)).await.unwrap();
        f.clock.advance(Duration::seconds(3));

        let outcome = f.monitor.on_client_disconnect("s1", "client closed").await.unwrap();
        assert_eq!(outcome, InterruptOutcome::Discarded);
        assert!(f.monitor.drafts().is_empty());
    }

    #[tokio::test]
    async fn test_long_dwelled_session_becomes_draft() {
        let f = fixture();
        let session = register(&f, "s1", "Explain pinning");
        session.set_expected_chunks(100);
        session.publish_chunk("y".repeat(201)).await.unwrap();
        f.clock.advance(Duration::seconds(11));

        let outcome = f.monitor.on_client_disconnect("s1", "tab closed").await.unwrap();
        assert_eq!(outcome, InterruptOutcome::DraftRetained(DraftReason::LongAndDwelled));
    }

    #[tokio::test]
    async fn test_drafts_are_capped() {
        let f = fixture_with(MonitorConfig {
            draft_capacity: 2,
            ..MonitorConfig::default()
        });
        for id in ["a", "b", "c"] {
            let session = register(&f, id, "q");
            session.set_expected_chunks(1);
            session.publish_chunk("done").await.unwrap();
            f.monitor.on_client_disconnect(id, "gone").await.unwrap();
        }

        let ids: Vec<String> = f.monitor.drafts().into_iter().map(|d| d.session_id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_interrupt_after_completion_is_noop() {
        let f = fixture();
        register(&f, "s1", "q");
        assert!(f.monitor.complete("s1").await.unwrap());

        let outcome = f.monitor.on_client_disconnect("s1", "late").await.unwrap();
        assert_eq!(outcome, InterruptOutcome::AlreadyFinished);
        assert!(!f.monitor.complete("s1").await.unwrap());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Completion
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_valid_completion_cached_once_unrated() {
        let f = fixture();
        let session = register(&f, "s1", "How do I cancel a tokio task?");
        session
            .publish_chunk("Call abort() on its JoinHandle, or select! against a cancellation signal.")
            .await
            .unwrap();
        f.clock.advance(Duration::seconds(3));

        assert!(f.monitor.complete("s1").await.unwrap());
        f.monitor.wait_for_cache_writes().await;

        let entries = f.cache.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id.as_deref(), Some("s1"));
        assert_eq!(entries[0].rating, 0.0);
        assert!(session.snapshot().saved_to_cache);
    }

    #[tokio::test]
    async fn test_invalid_completion_not_cached() {
        let f = fixture();
        let session = register(&f, "short", "q1");
        session.publish_chunk("too short").await.unwrap();
        f.clock.advance(Duration::seconds(5));
        f.monitor.complete("short").await.unwrap();

        let session = register(&f, "quick", "q2");
        session.publish_chunk("z".repeat(80)).await.unwrap();
        f.monitor.complete("quick").await.unwrap();

        f.monitor.wait_for_cache_writes().await;
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn test_failed_session_never_cached() {
        let f = fixture();
        let session = register(&f, "s1", "q");
        session.publish_chunk("w".repeat(100)).await.unwrap();
        f.clock.advance(Duration::seconds(5));

        assert!(f.monitor.fail("s1", "upstream 500").await.unwrap());
        assert!(!f.monitor.complete("s1").await.unwrap());
        f.monitor.wait_for_cache_writes().await;
        assert!(f.cache.is_empty());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sweep
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_sweep_interrupts_stale_and_forgets_finished() {
        let f = fixture();
        let stale = register(&f, "stale", "q");
        f.clock.advance(Duration::seconds(301));
        let fresh = register(&f, "fresh", "q");
        let done = register(&f, "done", "q");
        f.monitor.complete("done").await.unwrap();

        assert_eq!(f.monitor.sweep().await, 1);
        assert_eq!(stale.snapshot().interrupt_reason.as_deref(), Some(TIMEOUT_REASON));
        assert!(stale.is_cancelled());
        assert_eq!(fresh.status(), crate::session::SessionStatus::Created);
        assert!(done.status().is_terminal());

        let stats = f.monitor.stats();
        assert_eq!(stats.tracked_sessions, 1);
        assert_eq!(stats.active_sessions, 1);
    }
}
