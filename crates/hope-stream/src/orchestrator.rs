//! StreamingOrchestrator: dual-track answering.
//!
//! Every question starts two independent tasks. The fast path looks the
//! question up in the knowledge tiers and is informational only; it never
//! gates streaming and has no ordering relative to the first chunk. The
//! generation task builds a prompt, streams the connector's answer into the
//! session, and ends the session through the monitor.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hope_core::{
    FastAnswer, FastPath, KnowledgeManager, PlainPrompt, PromptSource, SharedClock, StreamingConfig,
};

use crate::connector::{GenerationStream, GenerativeConnector};
use crate::error::{Result, StreamError};
use crate::monitor::SessionMonitor;
use crate::session::{SessionStatus, StreamingSession, Subscription};

/// A question to answer
#[derive(Debug, Clone, Default)]
pub struct AskRequest {
    pub question: String,
    pub user_id: Option<String>,
    /// Conversation used for prompt context and turn history
    pub conversation_id: Option<String>,
    /// Explicit session id; one is allocated when absent
    pub session_id: Option<String>,
}

impl AskRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Handles for one in-flight question
pub struct AskHandle {
    pub session_id: String,
    pub session: Arc<StreamingSession>,
    /// Fast-path lookup result
    pub fast: JoinHandle<FastAnswer>,
    /// Events from the first chunk to the terminal event
    pub events: Subscription,
    /// Resolves to the session's terminal status
    pub generation: JoinHandle<SessionStatus>,
}

/// Per-question entry point
pub struct StreamingOrchestrator {
    router: Arc<dyn FastPath>,
    connector: Arc<dyn GenerativeConnector>,
    prompts: Arc<dyn PromptSource>,
    monitor: Arc<SessionMonitor>,
    config: StreamingConfig,
    clock: SharedClock,
}

impl StreamingOrchestrator {
    pub fn new(
        router: Arc<dyn FastPath>,
        connector: Arc<dyn GenerativeConnector>,
        prompts: Arc<dyn PromptSource>,
        monitor: Arc<SessionMonitor>,
        config: StreamingConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            router,
            connector,
            prompts,
            monitor,
            config,
            clock,
        }
    }

    /// Wire an orchestrator over a knowledge manager.
    ///
    /// A disabled manager gets the no-op router, plain prompts, and a monitor
    /// that never writes back to the cache.
    pub fn from_manager(
        manager: Arc<KnowledgeManager>,
        connector: Arc<dyn GenerativeConnector>,
        clock: SharedClock,
    ) -> Self {
        let config = manager.config().clone();
        let prompts: Arc<dyn PromptSource> = if manager.is_enabled() {
            manager.clone()
        } else {
            Arc::new(PlainPrompt)
        };
        let cache = manager.is_enabled().then(|| manager.ordinary().clone());
        let monitor = Arc::new(SessionMonitor::new(config.monitor, clock.clone(), cache));
        Self::new(manager.router(), connector, prompts, monitor, config.streaming, clock)
    }

    pub fn monitor(&self) -> &Arc<SessionMonitor> {
        &self.monitor
    }

    /// Answer a question with a fresh session.
    pub async fn ask(&self, question: &str, user: Option<&str>) -> Result<AskHandle> {
        let mut request = AskRequest::new(question);
        request.user_id = user.map(str::to_string);
        self.ask_with(request).await
    }

    pub async fn ask_with(&self, request: AskRequest) -> Result<AskHandle> {
        let session_id = request
            .session_id
            .unwrap_or_else(|| format!("sess_{}", Uuid::new_v4().simple()));

        let mut session = StreamingSession::new(&session_id, &request.question, self.clock.clone(), &self.config);
        if let Some(user_id) = request.user_id {
            session = session.with_user(user_id);
        }
        if let Some(conversation_id) = request.conversation_id {
            session = session.with_conversation(conversation_id);
        }
        let session = Arc::new(session);
        self.monitor.register(session.clone())?;
        let events = session.subscribe().await?;
        info!(session_id = %session_id, "Question accepted");

        let router = self.router.clone();
        let question = request.question.clone();
        let fast_session_id = session_id.clone();
        let fast = tokio::task::spawn_blocking(move || {
            let answer = router.lookup(&question);
            debug!(
                session_id = %fast_session_id,
                source = %answer.source,
                hit = answer.is_hit(),
                elapsed_ms = answer.elapsed.as_millis() as u64,
                "Fast path finished"
            );
            answer
        });

        let generation = tokio::spawn(run_generation(
            self.connector.clone(),
            self.prompts.clone(),
            self.monitor.clone(),
            session.clone(),
        ));

        Ok(AskHandle {
            session_id,
            session,
            fast,
            events,
            generation,
        })
    }

    /// The client behind a session went away.
    pub async fn disconnect(&self, session_id: &str, reason: &str) -> Result<()> {
        self.monitor.on_client_disconnect(session_id, reason).await?;
        Ok(())
    }
}

enum Finish {
    Done,
    Cancelled,
    Failed(StreamError),
}

async fn run_generation(
    connector: Arc<dyn GenerativeConnector>,
    prompts: Arc<dyn PromptSource>,
    monitor: Arc<SessionMonitor>,
    session: Arc<StreamingSession>,
) -> SessionStatus {
    let session_id = session.id().to_string();
    session.start();
    let prompt = prompts.build_prompt(session.question(), session.conversation_id());

    let finish = tokio::select! {
        biased;
        _ = session.cancelled() => Finish::Cancelled,
        result = stream_answer(connector.as_ref(), &session, &prompt) => match result {
            Ok(()) => Finish::Done,
            Err(e) if e.is_session_closed() => Finish::Cancelled,
            Err(e) => Finish::Failed(e),
        },
    };

    match finish {
        Finish::Done => match monitor.complete(&session_id).await {
            Ok(true) => {
                if let Some(conversation_id) = session.conversation_id() {
                    prompts.record_turn(conversation_id, session.question(), &session.answer());
                }
            }
            Ok(false) => debug!(session_id = %session_id, "Session finished elsewhere"),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Session left the registry before completion");
                session.complete().await;
            }
        },
        Finish::Cancelled => {
            debug!(session_id = %session_id, status = %session.status(), "Generation stopped");
        }
        Finish::Failed(e) => {
            let message = e.to_string();
            if let Err(e) = monitor.fail(&session_id, &message).await {
                warn!(session_id = %session_id, error = %e, "Session left the registry before failure");
                session.fail(message).await;
            }
        }
    }
    session.status()
}

/// Pump the connector's output into the session.
async fn stream_answer(connector: &dyn GenerativeConnector, session: &StreamingSession, prompt: &str) -> Result<()> {
    if !connector.supports_streaming() {
        let answer = connector.generate(prompt).await?;
        session.set_expected_chunks(1);
        session.publish_chunk(answer).await?;
        return Ok(());
    }

    let GenerationStream {
        mut chunks,
        expected_chunks,
    } = connector.generate_stream(prompt).await?;
    if let Some(expected) = expected_chunks {
        session.set_expected_chunks(expected);
    }
    while let Some(chunk) = chunks.next().await {
        session.publish_chunk(chunk?).await?;
    }
    Ok(())
}
