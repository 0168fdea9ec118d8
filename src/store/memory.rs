use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::conversation::ConversationTree;
use crate::error::{RagError, Result};
use crate::models::{
    Branch, Chat, ChatHistory, ChatSummary, Document, KnowledgeBase, Message, MessageStatus, Role,
};
use crate::store::{ChatStore, KnowledgeStore, Persisted};

// ─── Chats ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChatData {
    chats: HashMap<Uuid, Chat>,
    messages: HashMap<Uuid, Message>,
}

impl ChatData {
    fn chat_mut(&mut self, chat_id: Uuid) -> Result<&mut Chat> {
        self.chats
            .get_mut(&chat_id)
            .ok_or_else(|| RagError::not_found(format!("chat {chat_id}")))
    }

    fn message_mut(&mut self, message_id: Uuid) -> Result<&mut Message> {
        self.messages
            .get_mut(&message_id)
            .ok_or_else(|| RagError::not_found(format!("message {message_id}")))
    }

    /// Add a message at the end of the chat's active line.
    fn push(&mut self, chat_id: Uuid, role: Role, content: &str, status: MessageStatus) -> Result<Message> {
        let mut message = Message {
            id: Uuid::now_v7(),
            chat_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
            branch_id: None,
            status,
            error: None,
        };
        let chat = self.chat_mut(chat_id)?;
        message.branch_id = chat.tree.append(message.id);
        chat.updated_at = message.created_at;
        self.messages.insert(message.id, message.clone());
        Ok(message)
    }
}

/// Chats and messages held in memory, optionally mirrored to one JSON file.
/// A write becomes visible only once it is on disk.
pub struct MemoryChatStore {
    data: Persisted<ChatData>,
}

impl MemoryChatStore {
    pub fn in_memory() -> Self {
        Self {
            data: Persisted::in_memory(),
        }
    }

    /// Load `path` if it exists and persist every later write to it.
    pub fn open(path: PathBuf) -> Result<Self> {
        let path_display = path.display().to_string();
        let data = Persisted::<ChatData>::open(path)?;
        {
            let loaded = data.read();
            tracing::info!(
                "Loaded {} chats ({} messages) from {}",
                loaded.chats.len(),
                loaded.messages.len(),
                path_display
            );
        }
        Ok(Self { data })
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn create_chat(
        &self,
        user_id: &str,
        title: &str,
        model_id: &str,
        knowledge_base_id: Option<Uuid>,
    ) -> Result<Chat> {
        let now = Utc::now();
        let chat = Chat {
            id: Uuid::now_v7(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            model_id: model_id.to_string(),
            knowledge_base_id,
            created_at: now,
            updated_at: now,
            tree: ConversationTree::new(),
        };

        self.data.update(|data| {
            data.chats.insert(chat.id, chat.clone());
            Ok(())
        })?;
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: Uuid) -> Result<Chat> {
        self.data
            .read()
            .chats
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| RagError::not_found(format!("chat {chat_id}")))
    }

    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatSummary>> {
        let data = self.data.read();
        let mut chats: Vec<ChatSummary> = data
            .chats
            .values()
            .filter(|c| c.user_id == user_id)
            .map(|c| ChatSummary {
                id: c.id,
                title: c.title.clone(),
                updated_at: c.updated_at,
            })
            .collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(chats)
    }

    async fn delete_chat(&self, chat_id: Uuid) -> Result<()> {
        self.data.update(|data| {
            if data.chats.remove(&chat_id).is_none() {
                return Err(RagError::not_found(format!("chat {chat_id}")));
            }
            data.messages.retain(|_, m| m.chat_id != chat_id);
            Ok(())
        })
    }

    async fn append_message(
        &self,
        chat_id: Uuid,
        role: Role,
        content: &str,
        status: MessageStatus,
    ) -> Result<Message> {
        self.data.update(|data| data.push(chat_id, role, content, status))
    }

    async fn begin_turn(&self, chat_id: Uuid, user_content: &str) -> Result<(Message, Message)> {
        self.data.update(|data| {
            let question = data.push(chat_id, Role::User, user_content, MessageStatus::Complete)?;
            let reply = data.push(chat_id, Role::Assistant, "", MessageStatus::Streaming)?;
            Ok((question, reply))
        })
    }

    async fn get_message(&self, message_id: Uuid) -> Result<Message> {
        self.data
            .read()
            .messages
            .get(&message_id)
            .cloned()
            .ok_or_else(|| RagError::not_found(format!("message {message_id}")))
    }

    async fn update_message(&self, message_id: Uuid, content: &str) -> Result<()> {
        self.data.update(|data| {
            let message = data.message_mut(message_id)?;
            if message.status != MessageStatus::Streaming {
                return Err(RagError::config(format!("message {message_id} is already sealed")));
            }
            message.content = content.to_string();
            Ok(())
        })
    }

    async fn seal_message(
        &self,
        message_id: Uuid,
        content: &str,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<Message> {
        self.data.update(|data| {
            let message = data.message_mut(message_id)?;
            message.content = content.to_string();
            message.status = status;
            message.error = error;
            let sealed = message.clone();

            if let Some(chat) = data.chats.get_mut(&sealed.chat_id) {
                chat.updated_at = Utc::now();
            }
            Ok(sealed)
        })
    }

    async fn history(&self, chat_id: Uuid) -> Result<ChatHistory> {
        let data = self.data.read();
        let chat = data
            .chats
            .get(&chat_id)
            .ok_or_else(|| RagError::not_found(format!("chat {chat_id}")))?;

        let messages = chat
            .tree
            .active_line()
            .iter()
            .filter_map(|id| data.messages.get(id).cloned())
            .collect();

        Ok(ChatHistory {
            id: chat.id,
            title: chat.title.clone(),
            active_branch_id: chat.tree.active_branch_id(),
            branches: chat.tree.branches().to_vec(),
            messages,
        })
    }

    async fn create_branch(
        &self,
        chat_id: Uuid,
        source_message_id: Uuid,
        name: &str,
        activate: bool,
    ) -> Result<Branch> {
        self.data.update(|data| {
            let chat = data.chat_mut(chat_id)?;
            let branch = chat.tree.create_branch(source_message_id, name)?;
            if activate {
                chat.tree.switch_active(Some(branch.id))?;
            }
            chat.updated_at = Utc::now();
            Ok(branch)
        })
    }

    async fn switch_branch(&self, chat_id: Uuid, branch_id: Option<Uuid>) -> Result<()> {
        self.data
            .update(|data| data.chat_mut(chat_id)?.tree.switch_active(branch_id))
    }

    async fn edit_message(&self, chat_id: Uuid, message_id: Uuid, content: &str) -> Result<Message> {
        self.data.update(|data| {
            let chat = data.chat_mut(chat_id)?;
            if !chat.tree.active_line().contains(&message_id) {
                return Err(RagError::not_found(format!(
                    "message {message_id} is not on the active line"
                )));
            }
            chat.updated_at = Utc::now();

            if !chat.tree.is_shared(message_id) {
                let message = data.message_mut(message_id)?;
                message.content = content.to_string();
                return Ok(message.clone());
            }

            let active = chat.tree.active_branch_id();
            let copy_id = Uuid::now_v7();
            chat.tree.replace_in_active(message_id, copy_id)?;

            let original = data
                .messages
                .get(&message_id)
                .ok_or_else(|| RagError::not_found(format!("message {message_id}")))?;
            let copy = Message {
                id: copy_id,
                content: content.to_string(),
                created_at: Utc::now(),
                branch_id: active,
                status: MessageStatus::Complete,
                error: None,
                ..original.clone()
            };
            data.messages.insert(copy_id, copy.clone());
            Ok(copy)
        })
    }
}

// ─── Knowledge bases ─────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KnowledgeData {
    knowledge_bases: HashMap<Uuid, KnowledgeBase>,
    documents: HashMap<Uuid, Document>,
}

/// Knowledge base and document metadata. Vectors live in the `VectorStore`.
pub struct MemoryKnowledgeStore {
    data: Persisted<KnowledgeData>,
}

impl MemoryKnowledgeStore {
    pub fn in_memory() -> Self {
        Self {
            data: Persisted::in_memory(),
        }
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        let path_display = path.display().to_string();
        let data = Persisted::<KnowledgeData>::open(path)?;
        {
            let loaded = data.read();
            tracing::info!(
                "Loaded {} knowledge bases ({} documents) from {}",
                loaded.knowledge_bases.len(),
                loaded.documents.len(),
                path_display
            );
        }
        Ok(Self { data })
    }
}

#[async_trait]
impl KnowledgeStore for MemoryKnowledgeStore {
    async fn create_knowledge_base(&self, kb: KnowledgeBase) -> Result<KnowledgeBase> {
        self.data.update(|data| {
            data.knowledge_bases.insert(kb.id, kb.clone());
            Ok(())
        })?;
        Ok(kb)
    }

    async fn get_knowledge_base(&self, kb_id: Uuid) -> Result<KnowledgeBase> {
        self.data
            .read()
            .knowledge_bases
            .get(&kb_id)
            .cloned()
            .ok_or_else(|| RagError::not_found(format!("knowledge base {kb_id}")))
    }

    async fn list_knowledge_bases(&self, owner_id: &str) -> Result<Vec<KnowledgeBase>> {
        let data = self.data.read();
        let mut kbs: Vec<KnowledgeBase> = data
            .knowledge_bases
            .values()
            .filter(|kb| kb.owner_id == owner_id)
            .cloned()
            .collect();
        kbs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(kbs)
    }

    async fn delete_knowledge_base(&self, kb_id: Uuid) -> Result<()> {
        self.data.update(|data| {
            if data.knowledge_bases.remove(&kb_id).is_none() {
                return Err(RagError::not_found(format!("knowledge base {kb_id}")));
            }
            data.documents.retain(|_, d| d.knowledge_base_id != kb_id);
            Ok(())
        })
    }

    async fn put_document(&self, document: Document) -> Result<Option<Document>> {
        self.data.update(|data| {
            let kb = data
                .knowledge_bases
                .get_mut(&document.knowledge_base_id)
                .ok_or_else(|| {
                    RagError::not_found(format!("knowledge base {}", document.knowledge_base_id))
                })?;
            kb.updated_at = Utc::now();

            let previous_id = data
                .documents
                .values()
                .find(|d| {
                    d.knowledge_base_id == document.knowledge_base_id
                        && d.filename == document.filename
                        && d.id != document.id
                })
                .map(|d| d.id);
            let previous = previous_id.and_then(|id| data.documents.remove(&id));

            data.documents.insert(document.id, document);
            Ok(previous)
        })
    }

    async fn find_document(&self, kb_id: Uuid, filename: &str) -> Result<Option<Document>> {
        Ok(self
            .data
            .read()
            .documents
            .values()
            .find(|d| d.knowledge_base_id == kb_id && d.filename == filename)
            .cloned())
    }

    async fn list_documents(&self, kb_id: Uuid) -> Result<Vec<Document>> {
        let data = self.data.read();
        let mut docs: Vec<Document> = data
            .documents
            .values()
            .filter(|d| d.knowledge_base_id == kb_id)
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.id);
        Ok(docs)
    }

    async fn delete_document(&self, kb_id: Uuid, document_id: Uuid) -> Result<Document> {
        self.data.update(|data| match data.documents.get(&document_id) {
            Some(d) if d.knowledge_base_id == kb_id => data
                .documents
                .remove(&document_id)
                .ok_or_else(|| RagError::not_found(format!("document {document_id}"))),
            _ => Err(RagError::not_found(format!("document {document_id}"))),
        })
    }
}
