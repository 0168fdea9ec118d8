//! One chat turn, end to end.
//!
//! ```text
//!  start()                       spawned turn task
//!  ───────                       ─────────────────
//!  validate, resolve model  ──►  open provider stream
//!  create/load chat              ┌─► read bytes (idle timeout, disconnect)
//!  persist user msg + empty      │   StreamSession: feed → next_step
//!    assistant msg (one write)   │
//!  build context + prompt        │
//!                                │   Delta → send (cap 1 channel) → checkpoint
//!                                └── until CLOSED / FAILED / disconnect
//!                                seal message (retry once) → [DONE] → message
//! ```
//!
//! Everything that can fail before the provider is contacted fails
//! `start()` itself; afterwards failures end the turn in FAILED with the
//! partial text sealed as an error.

pub mod frame;
pub mod prompt;
pub mod session;

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::{RagError, Result};
use crate::llm::chat_stream::{CompletionProvider, CompletionRequest};
use crate::models::{ChatTarget, ChatTurnRequest, Message, MessageStatus};
use crate::search::context::ContextAssembler;
use crate::store::{ChatStore, ModelConfigProvider, ModelEndpoint, UserIdentity};

use session::{StreamSession, Step};

/// Characters of the first user message used as a new chat's title.
const TITLE_CHARS: usize = 50;

/// What the client sees, in order: deltas, at most one error, an optional
/// persistence warning, the end sentinel, then the stored message.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Delta(String),
    Error(String),
    Warning(String),
    Done,
    Message(Message),
}

/// A running turn.
#[derive(Debug)]
pub struct TurnHandle {
    pub chat_id: Uuid,
    pub events: mpsc::Receiver<RelayEvent>,
}

#[derive(Clone)]
pub struct StreamRelay {
    chats: Arc<dyn ChatStore>,
    models: Arc<dyn ModelConfigProvider>,
    provider: Arc<dyn CompletionProvider>,
    context: ContextAssembler,
    config: RelayConfig,
    context_top_k: usize,
    permits: Arc<Semaphore>,
}

impl StreamRelay {
    pub fn new(
        chats: Arc<dyn ChatStore>,
        models: Arc<dyn ModelConfigProvider>,
        provider: Arc<dyn CompletionProvider>,
        context: ContextAssembler,
        config: RelayConfig,
        context_top_k: usize,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_turns.max(1)));
        Self {
            chats,
            models,
            provider,
            context,
            config,
            context_top_k,
            permits,
        }
    }

    /// Validate the request, persist the user message with an empty
    /// streaming reply after it, and spawn the turn that fills the reply in.
    pub async fn start(&self, user: &UserIdentity, req: ChatTurnRequest) -> Result<TurnHandle> {
        let (current, prior) = match req.prior_messages.split_last() {
            Some((last, prior)) if last.role == "user" && !last.content.trim().is_empty() => (last, prior),
            _ => {
                return Err(RagError::config(
                    "the last message must be a non-empty user message",
                ))
            }
        };
        let endpoint = self.models.get_model(&req.model_id).await?;

        let chat = match req.chat_id {
            ChatTarget::New => {
                let title = prompt::truncate_to_char_boundary(current.content.trim(), TITLE_CHARS);
                self.chats
                    .create_chat(&user.id, &title, &req.model_id, req.kb_id)
                    .await?
            }
            ChatTarget::Existing(id) => {
                let chat = self.chats.get_chat(id).await?;
                if chat.user_id != user.id {
                    return Err(RagError::Authorization(format!("chat {id}")));
                }
                chat
            }
        };

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RagError::terminal("chat service is shutting down"))?;

        let (_, assistant) = self.chats.begin_turn(chat.id, &current.content).await?;

        let kb_id = req.kb_id.or(chat.knowledge_base_id);
        let context = self
            .context
            .build_context(kb_id, &current.content, self.context_top_k)
            .await;
        let system = prompt::build_system_prompt(
            req.parameters.system_prompt.as_deref(),
            &context,
            req.show_reasoning_trace,
        );
        let history = prompt::sanitize_history(prior, self.config.max_history_turns);
        let request = CompletionRequest {
            messages: prompt::build_messages(system, &history, &current.content),
            parameters: req.parameters,
        };

        tracing::info!(
            "Chat turn on {} with model {} ({} prior turns, {} context chars)",
            chat.id,
            endpoint.model_name,
            history.len(),
            context.chars().count()
        );

        let (tx, rx) = mpsc::channel(1);
        let relay = self.clone();
        let chat_id = chat.id;
        tokio::spawn(async move {
            relay.run_turn(assistant, endpoint, request, tx, permit).await;
        });

        Ok(TurnHandle { chat_id, events: rx })
    }

    async fn run_turn(
        &self,
        assistant: Message,
        endpoint: ModelEndpoint,
        request: CompletionRequest,
        tx: mpsc::Sender<RelayEvent>,
        _permit: OwnedSemaphorePermit,
    ) {
        let chat_id = assistant.chat_id;
        let mut session = StreamSession::new(self.config.max_pending_bytes);
        let disconnected = self.pump(&mut session, &assistant, &endpoint, &request, &tx).await;

        let (status, error) = if disconnected {
            tracing::info!("Client left chat {chat_id} mid-stream, keeping partial reply");
            (MessageStatus::Error, Some("client disconnected".to_string()))
        } else if let Some(err) = session.error() {
            tracing::error!("Chat turn on {chat_id} failed: {err}");
            (MessageStatus::Error, Some(err.to_string()))
        } else {
            tracing::info!(
                "Chat turn on {chat_id} complete ({} deltas, {} chars)",
                session.delta_count(),
                session.text().chars().count()
            );
            (MessageStatus::Complete, None)
        };

        let sealed = self
            .seal_with_retry(assistant.id, session.text(), status, error.clone())
            .await;
        if disconnected {
            return;
        }

        let message = match sealed {
            Ok(message) => message,
            Err(e) => {
                let _ = tx
                    .send(RelayEvent::Warning(format!("reply was delivered but not saved: {e}")))
                    .await;
                Message {
                    content: session.text().to_string(),
                    status,
                    error,
                    ..assistant
                }
            }
        };
        if tx.send(RelayEvent::Done).await.is_ok() {
            let _ = tx.send(RelayEvent::Message(message)).await;
        }
    }

    /// Drive the session until it is terminal. Returns true when the client
    /// went away first. The provider stream is dropped on return, which
    /// closes the upstream connection.
    async fn pump(
        &self,
        session: &mut StreamSession,
        assistant: &Message,
        endpoint: &ModelEndpoint,
        request: &CompletionRequest,
        tx: &mpsc::Sender<RelayEvent>,
    ) -> bool {
        let opened = tokio::select! {
            _ = tx.closed() => return true,
            opened = self.provider.open(endpoint, request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                session.fail(e.to_string());
                if let Some(Step::Failed(message)) = session.next_step() {
                    let _ = tx.send(RelayEvent::Error(message)).await;
                }
                return tx.is_closed();
            }
        };

        let idle = Duration::from_secs(self.config.idle_timeout_secs);
        loop {
            while let Some(step) = session.next_step() {
                match step {
                    Step::Delta(delta) => {
                        if tx.send(RelayEvent::Delta(delta)).await.is_err() {
                            return true;
                        }
                        self.checkpoint(session, assistant.id).await;
                    }
                    Step::Closed => return false,
                    Step::Failed(message) => {
                        return tx.send(RelayEvent::Error(message)).await.is_err();
                    }
                }
            }

            let read = tokio::select! {
                biased;
                _ = tx.closed() => return true,
                read = tokio::time::timeout(idle, stream.next()) => read,
            };
            match read {
                Ok(Some(Ok(bytes))) => session.feed(&bytes),
                Ok(Some(Err(e))) => session.fail(e.to_string()),
                Ok(None) => session.end_of_stream(),
                Err(_) => session.fail(format!(
                    "provider sent nothing for {}s",
                    self.config.idle_timeout_secs
                )),
            }
        }
    }

    async fn checkpoint(&self, session: &StreamSession, message_id: Uuid) {
        let every = self.config.checkpoint_every;
        if every == 0 || session.delta_count() % every != 0 {
            return;
        }
        if let Err(e) = self.chats.update_message(message_id, session.text()).await {
            tracing::warn!("Checkpoint of message {message_id} failed: {e}");
        }
    }

    async fn seal_with_retry(
        &self,
        message_id: Uuid,
        content: &str,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<Message> {
        match self
            .chats
            .seal_message(message_id, content, status, error.clone())
            .await
        {
            Ok(m) => Ok(m),
            Err(first) => {
                tracing::warn!("Saving message {message_id} failed, retrying once: {first}");
                self.chats
                    .seal_message(message_id, content, status, error)
                    .await
                    .inspect_err(|e| tracing::error!("Saving message {message_id} failed again: {e}"))
            }
        }
    }
}
