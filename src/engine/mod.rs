pub mod lock;
pub mod stream;

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;

pub use lock::{Operation, SessionGuard, SessionLocks};
pub use stream::{CommitHandle, ERROR_MARKER, ResponseStream, error_fragment, is_error_fragment};

use std::sync::Arc;
use std::time;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::backend::ArcBackend;
use crate::config::Configuration;
use crate::models::session::{derive_title, next_timestamp};
use crate::models::{
    BackendError, BackendPrompt, EngineError, Event, FilterSession, Message, MessageSnapshot,
    MessageStatus, ModelInfo, Session, SessionSnapshot, SessionState,
};
use crate::prompt::{Assembler, PromptRequest};
use crate::retrieval::ArcRetriever;
use crate::storage::ArcStorage;
use stream::CommitResult;

/// Owns the session and message lifecycle.
///
/// Mutations on one session are serialized through [`SessionLocks`]; reads
/// never wait and only observe committed state. Answers are streamed back
/// through a [`ResponseStream`] while a background task accumulates them
/// and commits the final turn exactly once.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    storage: ArcStorage,
    backend: ArcBackend,
    assembler: Assembler,
    locks: SessionLocks,

    failure_answer: String,
    title_max_chars: usize,
    default_context_budget: usize,
    generation_timeout: time::Duration,
}

/// A turn ready to be generated, with the lock that protects it.
struct PendingTurn {
    guard: SessionGuard,
    session_id: String,
    history: Vec<Message>,
    message: Message,
    title: Option<String>,
    replaces: bool,
}

impl Engine {
    pub fn new(
        config: &Configuration,
        backend: ArcBackend,
        storage: ArcStorage,
        retriever: ArcRetriever,
    ) -> Self {
        let assembler = Assembler::new(retriever, &config.general.system_prompt, &config.context);
        Self {
            inner: Arc::new(Inner {
                storage,
                backend,
                assembler,
                locks: SessionLocks::default(),
                failure_answer: config.general.failure_answer.clone(),
                title_max_chars: config.general.title_max_chars,
                default_context_budget: config.context.default_context_budget,
                generation_timeout: time::Duration::from_secs(
                    config.backend.generation_timeout_secs,
                ),
            }),
        }
    }

    pub fn list_models(&self) -> Vec<ModelInfo> {
        self.inner.backend.models()
    }

    pub async fn create_session(&self, owner: &str) -> Result<SessionSnapshot, EngineError> {
        if owner.trim().is_empty() {
            return Err(EngineError::validation("owner must not be empty"));
        }

        let session = Session::new(owner);
        self.inner.storage.upsert_session(session.clone()).await?;
        log::debug!("Created session {} for {}", session.id(), owner);
        Ok(SessionSnapshot::from(&session))
    }

    /// Sessions of `owner`, most recently updated first.
    pub async fn list_sessions(&self, owner: &str) -> Result<Vec<SessionSnapshot>, EngineError> {
        self.search_sessions(owner, FilterSession::default()).await
    }

    /// Like [`Engine::list_sessions`], narrowed by `filter`. The owner of the
    /// filter is always replaced by `owner`.
    pub async fn search_sessions(
        &self,
        owner: &str,
        filter: FilterSession,
    ) -> Result<Vec<SessionSnapshot>, EngineError> {
        let sessions = self
            .inner
            .storage
            .get_sessions(filter.with_owner(owner))
            .await?;
        Ok(sessions.iter().map(SessionSnapshot::from).collect())
    }

    pub async fn get_session(
        &self,
        session_id: &str,
        owner: &str,
    ) -> Result<SessionSnapshot, EngineError> {
        let session = self.load_session(session_id, owner).await?;
        Ok(SessionSnapshot::from(&session))
    }

    pub async fn list_messages(
        &self,
        session_id: &str,
        owner: &str,
    ) -> Result<Vec<MessageSnapshot>, EngineError> {
        let session = self.load_session(session_id, owner).await?;
        Ok(session
            .messages()
            .iter()
            .map(|m| MessageSnapshot::new(session_id, m))
            .collect())
    }

    pub async fn session_state(
        &self,
        session_id: &str,
        owner: &str,
    ) -> Result<SessionState, EngineError> {
        let session = self.load_session(session_id, owner).await?;
        match self.inner.locks.holder(session_id) {
            Some(op) if op.is_generation() => Ok(SessionState::Streaming),
            _ => Ok(session.committed_state()),
        }
    }

    pub async fn append_message(
        &self,
        session_id: &str,
        owner: &str,
        content: &str,
        model_id: &str,
    ) -> Result<ResponseStream, EngineError> {
        self.validate_content(content)?;
        self.validate_model(model_id)?;
        let (guard, session) = self
            .lock_session(session_id, owner, Operation::Append)
            .await?;

        let message_idx = session.next_message_idx();
        let title = if message_idx == 1 {
            Some(derive_title(content, self.inner.title_max_chars))
        } else {
            None
        };
        log::debug!(
            "Appending message {} to session {} with model {}",
            message_idx,
            session_id,
            model_id
        );

        self.start_turn(PendingTurn {
            guard,
            session_id: session_id.to_string(),
            history: session.messages().to_vec(),
            message: Message::new(message_idx, content, model_id),
            title,
            replaces: false,
        })
        .await
    }

    /// Replaces content and model of the last message and generates a new
    /// answer for it. `message_idx` must address the last message.
    pub async fn edit_last_message(
        &self,
        session_id: &str,
        owner: &str,
        message_idx: usize,
        content: &str,
        model_id: &str,
    ) -> Result<ResponseStream, EngineError> {
        self.validate_content(content)?;
        self.validate_model(model_id)?;
        let (guard, mut session) = self.lock_session(session_id, owner, Operation::Edit).await?;

        let last_idx = session.len();
        if message_idx == 0 || message_idx > last_idx {
            return Err(EngineError::not_found(format!(
                "message {} not found in session {}",
                message_idx, session_id
            )));
        }
        if message_idx != last_idx {
            return Err(EngineError::validation(format!(
                "only the last message ({}) can be edited",
                last_idx
            )));
        }

        let Some(mut message) = session.messages_mut().pop() else {
            return Err(EngineError::not_found("session has no messages"));
        };
        message.set_content(content);
        message.set_model_id(model_id);
        message.set_answer(None);
        log::debug!(
            "Editing message {} of session {} with model {}",
            message_idx,
            session_id,
            model_id
        );

        self.start_turn(PendingTurn {
            guard,
            session_id: session_id.to_string(),
            history: session.messages().to_vec(),
            message,
            title: None,
            replaces: true,
        })
        .await
    }

    /// Generates a new answer for the unchanged content of the last message.
    pub async fn regenerate_last_message(
        &self,
        session_id: &str,
        owner: &str,
        model_id: &str,
    ) -> Result<ResponseStream, EngineError> {
        self.validate_model(model_id)?;
        let (guard, mut session) = self
            .lock_session(session_id, owner, Operation::Regenerate)
            .await?;

        let Some(mut message) = session.messages_mut().pop() else {
            return Err(EngineError::not_found(format!(
                "session {} has no messages",
                session_id
            )));
        };
        message.set_model_id(model_id);
        message.set_answer(None);
        log::debug!(
            "Regenerating message {} of session {} with model {}",
            message.message_idx(),
            session_id,
            model_id
        );

        self.start_turn(PendingTurn {
            guard,
            session_id: session_id.to_string(),
            history: session.messages().to_vec(),
            message,
            title: None,
            replaces: true,
        })
        .await
    }

    pub async fn delete_last_message(
        &self,
        session_id: &str,
        owner: &str,
    ) -> Result<MessageSnapshot, EngineError> {
        let (_guard, _) = self
            .lock_session(session_id, owner, Operation::DeleteLast)
            .await?;

        match self.inner.storage.delete_last_message(session_id).await? {
            Some(message) => {
                log::debug!(
                    "Deleted message {} of session {}",
                    message.message_idx(),
                    session_id
                );
                Ok(MessageSnapshot::new(session_id, &message))
            }
            None => Err(EngineError::not_found(format!(
                "session {} has no messages",
                session_id
            ))),
        }
    }

    /// Removes the session even while a turn is streaming; the in-flight
    /// commit notices and is abandoned.
    pub async fn delete_session(&self, session_id: &str, owner: &str) -> Result<(), EngineError> {
        self.load_session(session_id, owner).await?;
        if !self.inner.storage.delete_session(session_id).await? {
            return Err(not_found(session_id));
        }
        log::debug!("Deleted session {}", session_id);
        Ok(())
    }

    async fn load_session(&self, session_id: &str, owner: &str) -> Result<Session, EngineError> {
        match self.inner.storage.get_session(session_id).await? {
            Some(session) if session.is_owned_by(owner) => Ok(session),
            _ => Err(not_found(session_id)),
        }
    }

    /// Ownership is checked before the lock so a foreign session never
    /// reports a conflict. The session is read again under the lock to see
    /// the latest commit.
    async fn lock_session(
        &self,
        session_id: &str,
        owner: &str,
        operation: Operation,
    ) -> Result<(SessionGuard, Session), EngineError> {
        self.load_session(session_id, owner).await?;
        let guard = self.inner.locks.try_acquire(session_id, operation)?;
        let session = self.load_session(session_id, owner).await?;
        Ok((guard, session))
    }

    fn validate_content(&self, content: &str) -> Result<(), EngineError> {
        if content.trim().is_empty() {
            return Err(EngineError::validation("content must not be empty"));
        }
        Ok(())
    }

    fn validate_model(&self, model_id: &str) -> Result<(), EngineError> {
        if !self.inner.backend.supports(model_id) {
            return Err(EngineError::validation(format!(
                "unknown model_id: {}",
                model_id
            )));
        }
        Ok(())
    }

    /// Assembles the prompt, then hands the turn to a background task. Prompt
    /// failures surface here, before anything is streamed.
    async fn start_turn(&self, turn: PendingTurn) -> Result<ResponseStream, EngineError> {
        let model_id = turn.message.model_id().to_string();
        let retrieval = self
            .inner
            .backend
            .models()
            .iter()
            .any(|m| m.id == model_id && m.retrieval);
        let budget = self
            .inner
            .backend
            .context_budget(&model_id)
            .unwrap_or(self.inner.default_context_budget);

        let prompt = self
            .inner
            .assembler
            .assemble(PromptRequest {
                model_id: &model_id,
                history: &turn.history,
                content: turn.message.content(),
                budget,
                retrieval,
            })
            .await?;

        let (fragment_tx, fragment_rx) = mpsc::unbounded_channel::<String>();
        let (commit_tx, commit_rx) = oneshot::channel::<CommitResult>();
        let stream = ResponseStream::new(
            &turn.session_id,
            turn.message.message_idx(),
            fragment_rx,
            commit_rx,
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_turn(turn, prompt, fragment_tx, commit_tx).await;
        });

        Ok(stream)
    }
}

impl Inner {
    async fn run_turn(
        &self,
        turn: PendingTurn,
        prompt: BackendPrompt,
        fragment_tx: mpsc::UnboundedSender<String>,
        commit_tx: oneshot::Sender<CommitResult>,
    ) {
        let PendingTurn {
            guard,
            session_id,
            message,
            title,
            replaces,
            ..
        } = turn;

        let (answer, outcome) = self.generate(prompt, &fragment_tx).await;

        let mut message = message;
        let updated_at = if replaces {
            next_timestamp(message.updated_at())
        } else {
            Utc::now().max(message.created_at())
        };
        message.set_updated_at(updated_at);

        let failure = match outcome {
            Ok(()) => {
                message.set_answer(Some(answer));
                message.set_status(MessageStatus::Committed);
                None
            }
            Err(err) => {
                log::warn!(
                    "Generation for message {} of session {} failed: {}",
                    message.message_idx(),
                    session_id,
                    err
                );
                message.set_answer(Some(self.failure_answer.clone()));
                message.set_status(MessageStatus::Failed);
                Some(err.to_string())
            }
        };

        let result = match self
            .storage
            .commit_message(&session_id, message.clone(), title)
            .await
        {
            Ok(true) => {
                log::debug!(
                    "Committed message {} of session {}",
                    message.message_idx(),
                    session_id
                );
                Ok(MessageSnapshot::new(&session_id, &message))
            }
            Ok(false) => {
                log::warn!(
                    "Session {} was deleted while streaming, abandoning commit",
                    session_id
                );
                Err(not_found(&session_id))
            }
            Err(err) => {
                log::error!(
                    "Failed to commit message {} of session {}: {:?}",
                    message.message_idx(),
                    session_id,
                    err
                );
                Err(EngineError::from(err))
            }
        };
        log::trace!(
            "Releasing {} lock of session {}",
            guard.operation(),
            guard.session_id()
        );
        drop(guard);

        let marker = match (&result, failure) {
            (Ok(_), Some(detail)) => Some(detail),
            (Ok(_), None) => None,
            (Err(err), _) => Some(err.to_string()),
        };
        if let Some(detail) = marker {
            let _ = fragment_tx.send(error_fragment(&detail));
        }

        if commit_tx.send(result).is_err() {
            log::trace!("Commit of session {} has no listener", session_id);
        }
    }

    /// Runs the backend under the wall-clock budget, relaying fragments to
    /// the caller while accumulating them. A caller that went away does not
    /// stop generation.
    async fn generate(
        &self,
        prompt: BackendPrompt,
        fragment_tx: &mpsc::UnboundedSender<String>,
    ) -> (String, Result<(), BackendError>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

        let generation = tokio::time::timeout(
            self.generation_timeout,
            self.backend.generate(prompt, Arc::new(event_tx)),
        );

        let relay = async {
            let mut answer = String::new();
            while let Some(event) = event_rx.recv().await {
                match event {
                    Event::Fragment(text) => {
                        answer.push_str(&text);
                        let _ = fragment_tx.send(text);
                    }
                    Event::Usage(usage) => log::debug!("Generation usage: {}", usage),
                }
            }
            answer
        };

        let (outcome, answer) = tokio::join!(generation, relay);
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => Err(BackendError::Generation(format!(
                "generation timed out after {}s",
                self.generation_timeout.as_secs()
            ))),
        };
        (answer, outcome)
    }
}

fn not_found(session_id: &str) -> EngineError {
    EngineError::not_found(format!("session {} not found", session_id))
}
