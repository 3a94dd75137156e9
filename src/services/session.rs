use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::models::{Attachment, Role};
use crate::providers::{
    decode_stream, ChatMessage, ChatOptions, ChatRequest, InferenceBackend, ProviderError,
    StreamEvent,
};
use crate::services::accumulator::ResponseAccumulator;
use crate::services::continuation::{ContinuationController, ContinuationPolicy, PendingTurn};
use crate::services::conversation::{
    compose_user_message, messages_to_chat_messages, truncate_title, DEFAULT_TITLE_CHARS,
};
use crate::services::ledger::{ConversationStore, LedgerError};

const UPDATE_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Turn task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AwaitingConversation,
    Streaming,
    Reconciling,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often the running text is handed to the UI.
    pub batch_interval: Duration,
    pub continuation: ContinuationPolicy,
    pub title_chars: usize,
    pub system_prompt: Option<String>,
    pub options: ChatOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_interval: Duration::from_millis(50),
            continuation: ContinuationPolicy::default(),
            title_chars: DEFAULT_TITLE_CHARS,
            system_prompt: None,
            options: ChatOptions::default(),
        }
    }
}

/// Who is talking, where, and to which model.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub user_id: String,
    /// `None` starts a new conversation on the first turn.
    pub conversation_id: Option<String>,
    pub model: String,
    pub ephemeral: bool,
    /// Prior turns of an ephemeral conversation. Stored conversations load
    /// their own history.
    pub history: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnUpdate {
    ConversationCreated(String),
    /// Whole running text of the answer so far.
    Partial(String),
}

#[derive(Debug)]
pub enum TurnOutcome {
    Settled {
        text: String,
        conversation_id: Option<String>,
        persisted: bool,
    },
    /// Aborted by the user. `partial` is what had already been shown.
    Stopped { partial: String },
    Failed { error: TurnError, partial: String },
}

pub struct TurnHandle {
    updates: mpsc::Receiver<TurnUpdate>,
    state: watch::Receiver<TurnState>,
    cancel: CancellationToken,
    task: JoinHandle<TurnOutcome>,
}

impl TurnHandle {
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    /// `None` once the turn has finished and every update was read.
    pub async fn next_update(&mut self) -> Option<TurnUpdate> {
        self.updates.recv().await
    }

    pub async fn outcome(self) -> TurnOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => TurnOutcome::Failed {
                error: TurnError::Task(e.to_string()),
                partial: String::new(),
            },
        }
    }
}

enum StreamEnd {
    Completed(String),
    Cancelled(String),
    Failed(ProviderError, String),
}

struct TurnIo {
    updates: mpsc::Sender<TurnUpdate>,
    state: watch::Sender<TurnState>,
    cancel: CancellationToken,
}

impl TurnIo {
    fn set_state(&self, state: TurnState) {
        tracing::debug!(?state, "Turn state changed");
        self.state.send_replace(state);
    }

    fn emit(&self, update: TurnUpdate) {
        if let Err(TrySendError::Full(_)) = self.updates.try_send(update) {
            tracing::trace!("Update receiver is lagging, dropping snapshot");
        }
    }
}

pub struct ConversationSession {
    store: Arc<dyn ConversationStore>,
    backend: Arc<dyn InferenceBackend>,
    config: SessionConfig,
}

impl ConversationSession {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        backend: Arc<dyn InferenceBackend>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            backend,
            config,
        }
    }

    /// Run one turn in the background. The handle streams UI updates,
    /// carries the abort signal and resolves to the outcome.
    pub fn submit_turn(
        self: &Arc<Self>,
        ctx: TurnContext,
        user_text: String,
        attachment: Option<Attachment>,
    ) -> TurnHandle {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);
        let (state_tx, state_rx) = watch::channel(TurnState::Idle);
        let cancel = CancellationToken::new();

        let session = Arc::clone(self);
        let io = TurnIo {
            updates: updates_tx,
            state: state_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(async move {
            let outcome = session
                .run_turn(&ctx, &user_text, attachment.as_ref(), &io)
                .await;
            io.set_state(TurnState::Idle);
            outcome
        });

        TurnHandle {
            updates: updates_rx,
            state: state_rx,
            cancel,
            task,
        }
    }

    async fn run_turn(
        &self,
        ctx: &TurnContext,
        user_text: &str,
        attachment: Option<&Attachment>,
        io: &TurnIo,
    ) -> TurnOutcome {
        let user_message = compose_user_message(user_text, attachment);

        io.set_state(TurnState::AwaitingConversation);
        let (conversation_id, created, mut messages) = match self.prepare(ctx, io).await {
            Ok(prepared) => prepared,
            Err(error) => {
                tracing::warn!("Turn could not start: {}", error);
                return TurnOutcome::Failed {
                    error,
                    partial: String::new(),
                };
            }
        };

        messages.push(user_message.clone());
        let request = ChatRequest {
            model: ctx.model.clone(),
            messages,
            system_prompt: self.config.system_prompt.clone(),
            options: self.config.options.clone(),
        };

        io.set_state(TurnState::Streaming);
        let raw = match self.stream_into(request.clone(), "", io).await {
            StreamEnd::Completed(raw) => raw,
            StreamEnd::Cancelled(partial) => return TurnOutcome::Stopped { partial },
            StreamEnd::Failed(error, partial) => {
                tracing::warn!("Generation failed: {}", error);
                return TurnOutcome::Failed {
                    error: error.into(),
                    partial,
                };
            }
        };

        io.set_state(TurnState::Reconciling);
        let controller = ContinuationController::new(self.config.continuation);
        let mut turn = PendingTurn::new(raw);

        while controller.needs_repair(&turn) {
            let repair = controller.repair_request(&mut turn, &request);
            match self.stream_into(repair, turn.text(), io).await {
                StreamEnd::Completed(more) => controller.absorb(&mut turn, &more),
                StreamEnd::Cancelled(_) => {
                    return TurnOutcome::Stopped {
                        partial: turn.into_settled(),
                    }
                }
                StreamEnd::Failed(error, _) => {
                    tracing::warn!("Continuation request failed, keeping text as-is: {}", error);
                    break;
                }
            }
        }

        if turn.is_unterminated() {
            tracing::warn!(
                attempts = turn.attempts(),
                "Accepting response with an unterminated code block"
            );
        }

        let text = turn.into_settled();
        if io.cancel.is_cancelled() {
            return TurnOutcome::Stopped { partial: text };
        }

        let persisted = match &conversation_id {
            Some(id) => {
                self.persist(ctx, id, created, user_text, &user_message.content, &text)
                    .await
            }
            None => false,
        };

        TurnOutcome::Settled {
            text,
            conversation_id,
            persisted,
        }
    }

    /// Resolve the conversation and its history before any request goes out.
    async fn prepare(
        &self,
        ctx: &TurnContext,
        io: &TurnIo,
    ) -> Result<(Option<String>, bool, Vec<ChatMessage>), TurnError> {
        if ctx.ephemeral {
            return Ok((None, false, ctx.history.clone()));
        }

        match &ctx.conversation_id {
            Some(id) => {
                let stored = self.store.list_messages(id, &ctx.user_id).await?;
                Ok((Some(id.clone()), false, messages_to_chat_messages(&stored)))
            }
            None => {
                let conversation = self
                    .store
                    .create_conversation(&ctx.user_id, Some(&ctx.model))
                    .await?;
                io.emit(TurnUpdate::ConversationCreated(conversation.id.clone()));
                Ok((Some(conversation.id), true, Vec::new()))
            }
        }
    }

    /// Drive one generation request through decoder and accumulator. No
    /// storage lock is held while waiting on the network.
    async fn stream_into(&self, request: ChatRequest, prefix: &str, io: &TurnIo) -> StreamEnd {
        let bytes = tokio::select! {
            biased;
            _ = io.cancel.cancelled() => return StreamEnd::Cancelled(String::new()),
            result = self.backend.stream_chat(request) => match result {
                Ok(bytes) => bytes,
                Err(e) => return StreamEnd::Failed(e, String::new()),
            },
        };

        let mut frames = decode_stream(bytes);
        let mut acc = ResponseAccumulator::new();
        let mut ticker = tokio::time::interval(self.config.batch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = io.cancel.cancelled() => {
                    acc.discard_pending();
                    tracing::debug!("Turn aborted mid-stream");
                    return StreamEnd::Cancelled(acc.flushed_text().to_string());
                }
                _ = ticker.tick() => {
                    if let Some(snapshot) = acc.take_pending() {
                        io.emit(TurnUpdate::Partial(format!("{}{}", prefix, snapshot)));
                    }
                }
                frame = frames.next() => match frame {
                    Some(Ok(StreamEvent::Delta(fragment))) => acc.push(&fragment),
                    Some(Ok(StreamEvent::Done(full))) => {
                        acc.settle(&full);
                        break;
                    }
                    Some(Err(e)) => return StreamEnd::Failed(e, acc.into_raw()),
                    None => break,
                },
            }
        }

        if let Some(snapshot) = acc.take_pending() {
            io.emit(TurnUpdate::Partial(format!("{}{}", prefix, snapshot)));
        }
        StreamEnd::Completed(acc.into_raw())
    }

    /// Best-effort write of a settled turn. Failures are logged, never
    /// surfaced: the answer has already been delivered.
    async fn persist(
        &self,
        ctx: &TurnContext,
        conversation_id: &str,
        created: bool,
        user_text: &str,
        user_content: &str,
        answer: &str,
    ) -> bool {
        let user = ctx.user_id.as_str();

        if let Err(e) = self
            .store
            .append(conversation_id, user, Role::User, user_content)
            .await
        {
            tracing::error!(conversation_id, "Failed to save user message: {}", e);
            return false;
        }
        if let Err(e) = self
            .store
            .append(conversation_id, user, Role::Assistant, answer)
            .await
        {
            tracing::error!(conversation_id, "Failed to save assistant message: {}", e);
            return false;
        }

        let title = created.then(|| truncate_title(user_text, self.config.title_chars));
        if let Err(e) = self
            .store
            .update_metadata(conversation_id, user, title.as_deref(), Some(&ctx.model))
            .await
        {
            tracing::error!(conversation_id, "Failed to update conversation: {}", e);
        }
        if let Err(e) = self.store.clear_draft(user).await {
            tracing::error!("Failed to clear draft: {}", e);
        }

        true
    }
}
