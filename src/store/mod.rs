//! Repository interfaces the core is written against, plus the
//! collaborator interfaces for model lookup and identity.
//!
//! The in-memory implementations in [`memory`] and [`registry`] are what the
//! binary wires up; anything else (a database, a remote config service) can
//! be injected through `AppState` instead.

pub mod memory;
pub mod registry;

use async_trait::async_trait;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::models::{
    Branch, Chat, ChatHistory, ChatSummary, Document, KnowledgeBase, Message, MessageStatus, Role,
};

pub use memory::{MemoryChatStore, MemoryKnowledgeStore};
pub use registry::{ModelRegistry, StaticIdentity};

// ─── Collaborators ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

impl std::str::FromStr for ProviderKind {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(RagError::config(format!("Unknown LLM provider: {other}"))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi => f.write_str("OpenAI"),
            Self::Ollama => f.write_str("Ollama"),
        }
    }
}

/// Where and how to reach one chat model.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelEndpoint {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub credential: Option<String>,
    pub provider_kind: ProviderKind,
    pub model_name: String,
}

impl std::fmt::Debug for ModelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEndpoint")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("provider_kind", &self.provider_kind)
            .field("model_name", &self.model_name)
            .finish()
    }
}

#[async_trait]
pub trait ModelConfigProvider: Send + Sync {
    /// Resolve a model id. Unknown ids are a `Config` error.
    async fn get_model(&self, model_id: &str) -> Result<ModelEndpoint>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> Result<UserIdentity>;
}

// ─── Repositories ────────────────────────────────────────

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_chat(
        &self,
        user_id: &str,
        title: &str,
        model_id: &str,
        knowledge_base_id: Option<Uuid>,
    ) -> Result<Chat>;

    async fn get_chat(&self, chat_id: Uuid) -> Result<Chat>;

    /// Chats of one user, most recently updated first.
    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatSummary>>;

    /// Delete a chat and every message it owns.
    async fn delete_chat(&self, chat_id: Uuid) -> Result<()>;

    /// Append a message to the chat's active line. Appends to one chat are
    /// serialized; the store assigns id, timestamp and branch.
    async fn append_message(
        &self,
        chat_id: Uuid,
        role: Role,
        content: &str,
        status: MessageStatus,
    ) -> Result<Message>;

    /// Start a turn: append the user message and an empty streaming
    /// assistant reply as one write. Concurrent turns on a chat therefore
    /// never interleave, and a branch switch cannot land between the two.
    async fn begin_turn(&self, chat_id: Uuid, user_content: &str) -> Result<(Message, Message)>;

    async fn get_message(&self, message_id: Uuid) -> Result<Message>;

    /// Overwrite the content of a message that is still streaming.
    async fn update_message(&self, message_id: Uuid, content: &str) -> Result<()>;

    /// Final write of a streamed message: content, status and error.
    async fn seal_message(
        &self,
        message_id: Uuid,
        content: &str,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<Message>;

    /// Chat with the messages of its active line, in order.
    async fn history(&self, chat_id: Uuid) -> Result<ChatHistory>;

    async fn create_branch(
        &self,
        chat_id: Uuid,
        source_message_id: Uuid,
        name: &str,
        activate: bool,
    ) -> Result<Branch>;

    async fn switch_branch(&self, chat_id: Uuid, branch_id: Option<Uuid>) -> Result<()>;

    /// Edit a message on the active line, copy-on-write when another line
    /// shares it. Returns the message as it now appears on the active line.
    async fn edit_message(&self, chat_id: Uuid, message_id: Uuid, content: &str) -> Result<Message>;
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn create_knowledge_base(&self, kb: KnowledgeBase) -> Result<KnowledgeBase>;

    async fn get_knowledge_base(&self, kb_id: Uuid) -> Result<KnowledgeBase>;

    async fn list_knowledge_bases(&self, owner_id: &str) -> Result<Vec<KnowledgeBase>>;

    /// Remove a knowledge base and its documents.
    async fn delete_knowledge_base(&self, kb_id: Uuid) -> Result<()>;

    /// Store a document, replacing any document with the same filename in
    /// the same knowledge base. Returns the replaced document.
    async fn put_document(&self, document: Document) -> Result<Option<Document>>;

    async fn find_document(&self, kb_id: Uuid, filename: &str) -> Result<Option<Document>>;

    /// Documents of a knowledge base, oldest first.
    async fn list_documents(&self, kb_id: Uuid) -> Result<Vec<Document>>;

    async fn delete_document(&self, kb_id: Uuid, document_id: Uuid) -> Result<Document>;
}

/// Serialize `value` to `path` through a temp file and rename so readers
/// never see a half-written file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value)
        .map_err(|e| RagError::persistence(format!("serialize {}: {e}", path.display())))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RagError::persistence(format!("create {}: {e}", parent.display())))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)
        .map_err(|e| RagError::persistence(format!("write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| RagError::persistence(format!("rename {}: {e}", path.display())))
}

/// State held in memory and optionally mirrored to a JSON file.
///
/// A write runs against a copy; the copy is persisted and only then
/// replaces the live state. A failed write, whether rejected by the closure
/// or by the disk, leaves readers seeing exactly what they saw before.
pub(crate) struct Persisted<T> {
    data: RwLock<T>,
    path: Option<PathBuf>,
}

impl<T> Persisted<T>
where
    T: Clone + Default + Serialize + for<'de> Deserialize<'de>,
{
    pub(crate) fn in_memory() -> Self {
        Self {
            data: RwLock::new(T::default()),
            path: None,
        }
    }

    pub(crate) fn open(path: PathBuf) -> Result<Self> {
        Ok(Self {
            data: RwLock::new(read_json_or_default(&path)?),
            path: Some(path),
        })
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, T> {
        self.data.read()
    }

    /// Apply `change` and commit it. The write lock is held throughout, so
    /// writes are applied and persisted in one order.
    pub(crate) fn update<R>(&self, change: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut live = self.data.write();
        let mut next = live.clone();
        let out = change(&mut next)?;
        if let Some(path) = &self.path {
            write_json_atomic(path, &next)?;
        }
        *live = next;
        Ok(out)
    }
}

/// Load `path` if it exists, otherwise the default value.
pub(crate) fn read_json_or_default<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let data = std::fs::read(path)
        .map_err(|e| RagError::persistence(format!("read {}: {e}", path.display())))?;
    serde_json::from_slice(&data)
        .map_err(|e| RagError::persistence(format!("parse {}: {e}", path.display())))
}
