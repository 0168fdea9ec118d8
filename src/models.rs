use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::conversation::ConversationTree;

/// Metadata attached to every stored chunk.
pub type ChunkMetadata = BTreeMap<String, String>;

/// A named collection of documents sharing one chunking and embedding setup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBase {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A source document. Immutable once chunked; re-ingesting the same
/// filename replaces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Uuid,
    pub knowledge_base_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub size: usize,
    pub content: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
}

/// One embedded window of a document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub ordinal: usize,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A ranked vector search result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHit {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub ordinal: usize,
    pub score: f32,
    pub content: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Assistant reply still receiving deltas
    Streaming,
    Complete,
    /// Sealed with partial content after a failed turn
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub branch_id: Option<Uuid>,
    pub status: MessageStatus,
    pub error: Option<String>,
}

/// An alternate line forked from a message. `message_ids` is a copy taken
/// at fork time, not a view of the source line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: Uuid,
    pub parent_message_id: Uuid,
    pub name: String,
    pub message_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub model_id: String,
    pub knowledge_base_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tree: ConversationTree,
}

/// Chat listing entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: Uuid,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

/// Chat with the messages of its active line
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistory {
    pub id: Uuid,
    pub title: String,
    pub active_branch_id: Option<Uuid>,
    pub branches: Vec<Branch>,
    pub messages: Vec<Message>,
}

// ─── Requests ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKnowledgeBaseRequest {
    pub name: String,
    pub description: Option<String>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub embedding_model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBaseSummary {
    #[serde(flatten)]
    pub knowledge_base: KnowledgeBase,
    pub document_count: usize,
    pub chunk_count: usize,
}

/// Ingestion input. `kb_id` comes from the path.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub filename: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    pub raw_text: String,
}

fn default_mime_type() -> String {
    "text/plain".to_string()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub document: Document,
    pub chunk_count: usize,
    /// True when an earlier document with the same filename was replaced
    pub replaced: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub kb_id: Uuid,
    pub query_text: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub query_text: String,
    pub results: Vec<ChunkHit>,
}

/// A single prior turn as sent by the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// `"new"` or an existing chat id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(try_from = "String")]
pub enum ChatTarget {
    #[default]
    New,
    Existing(Uuid),
}

impl TryFrom<String> for ChatTarget {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "new" {
            return Ok(ChatTarget::New);
        }
        Uuid::parse_str(&value)
            .map(ChatTarget::Existing)
            .map_err(|e| format!("chatId must be \"new\" or a UUID: {e}"))
    }
}

/// Sampling parameters forwarded to the model
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelParameters {
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    pub stop_sequences: Vec<String>,
    pub seed: Option<i64>,
    #[serde(alias = "useJsonMode")]
    pub json_mode: bool,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            max_tokens: 4096,
            system_prompt: None,
            stop_sequences: Vec::new(),
            seed: None,
            json_mode: false,
        }
    }
}

/// Chat turn input. The last entry of `prior_messages` is the current user
/// message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurnRequest {
    #[serde(alias = "messages")]
    pub prior_messages: Vec<ChatMessage>,
    #[serde(default)]
    pub chat_id: ChatTarget,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(alias = "knowledgeBaseId")]
    pub kb_id: Option<Uuid>,
    #[serde(default = "default_true", alias = "showChainOfThought")]
    pub show_reasoning_trace: bool,
    #[serde(default)]
    pub parameters: ModelParameters,
}

fn default_model_id() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBranchRequest {
    pub source_message_id: Uuid,
    pub name: String,
    #[serde(default = "default_true")]
    pub activate: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchBranchRequest {
    pub branch_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}
