use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where chats, knowledge bases and vectors are persisted
    pub data_dir: PathBuf,
    /// Server bind address
    pub bind_addr: String,
    /// User id returned by the static identity provider
    pub user_id: String,
    /// Optional JSON file listing additional chat models
    pub models_file: Option<PathBuf>,
    /// Default LLM provider configuration
    pub llm: LlmConfig,
    /// Embedding retry policy
    pub embedding: EmbeddingConfig,
    /// Chunking and retrieval defaults
    pub rag: RagConfig,
    /// Streaming relay limits
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "ollama" or "openai"
    pub provider: String,
    /// Base URL for the LLM API
    pub base_url: String,
    /// Model name for chat
    pub chat_model: String,
    /// Model name for embeddings (used when a knowledge base doesn't name one)
    pub embedding_model: String,
    /// API key (only needed for cloud providers)
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Attempts per request, clamped to 1..=3
    pub max_attempts: u32,
    /// First backoff delay; doubles on each retry
    pub backoff_base_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    pub default_chunk_size: usize,
    pub default_chunk_overlap: usize,
    /// Chunks retrieved per chat turn
    pub context_top_k: usize,
    /// Maximum characters of injected context
    pub context_char_budget: usize,
    /// Prefix each context block with its source document
    pub tag_sources: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Fail the turn when the provider sends nothing for this long
    pub idle_timeout_secs: u64,
    /// Cap on buffered bytes that have not yet seen a frame delimiter
    pub max_pending_bytes: usize,
    /// Persist the partial assistant message every N deltas (0 = never)
    pub checkpoint_every: usize,
    /// Prior turns forwarded to the model
    pub max_history_turns: usize,
    /// Concurrent chat turns across the server
    pub max_concurrent_turns: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:9000".to_string(),
            user_id: "local".to_string(),
            models_file: None,
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            rag: RagConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            chat_model: "llama3.2".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            api_key: None,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 200,
        }
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 1000,
            default_chunk_overlap: 200,
            context_top_k: 5,
            context_char_budget: 6000,
            tag_sources: true,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
            max_pending_bytes: 1024 * 1024,
            checkpoint_every: 16,
            max_history_turns: 20,
            max_concurrent_turns: 8,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("KB_CHAT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("KB_CHAT_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(user) = std::env::var("KB_CHAT_USER_ID") {
            config.user_id = user;
        }
        if let Ok(path) = std::env::var("KB_CHAT_MODELS_FILE") {
            config.models_file = Some(PathBuf::from(path));
        }

        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            config.llm.provider = provider;
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("LLM_CHAT_MODEL") {
            config.llm.chat_model = model;
        }
        if let Ok(model) = std::env::var("LLM_EMBEDDING_MODEL") {
            config.llm.embedding_model = model;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }

        if let Some(v) = env_parse::<u32>("EMBED_MAX_ATTEMPTS") {
            config.embedding.max_attempts = v.clamp(1, 3);
        }
        if let Some(v) = env_parse("EMBED_BACKOFF_MS") {
            config.embedding.backoff_base_ms = v;
        }

        if let Some(v) = env_parse("KB_CHAT_CHUNK_SIZE") {
            config.rag.default_chunk_size = v;
        }
        if let Some(v) = env_parse("KB_CHAT_CHUNK_OVERLAP") {
            config.rag.default_chunk_overlap = v;
        }
        if let Some(v) = env_parse("KB_CHAT_CONTEXT_TOP_K") {
            config.rag.context_top_k = v;
        }
        if let Some(v) = env_parse("KB_CHAT_CONTEXT_CHAR_BUDGET") {
            config.rag.context_char_budget = v;
        }

        if let Some(v) = env_parse("KB_CHAT_IDLE_TIMEOUT_SECS") {
            config.relay.idle_timeout_secs = v;
        }
        if let Some(v) = env_parse("KB_CHAT_MAX_PENDING_BYTES") {
            config.relay.max_pending_bytes = v;
        }
        if let Some(v) = env_parse("KB_CHAT_CHECKPOINT_EVERY") {
            config.relay.checkpoint_every = v;
        }
        if let Some(v) = env_parse("KB_CHAT_MAX_HISTORY_TURNS") {
            config.relay.max_history_turns = v;
        }
        if let Some(v) = env_parse::<usize>("KB_CHAT_MAX_CONCURRENT_CHATS") {
            config.relay.max_concurrent_turns = v.max(1);
        }

        config
    }

    pub fn chats_path(&self) -> PathBuf {
        self.data_dir.join("chats.json")
    }

    pub fn knowledge_path(&self) -> PathBuf {
        self.data_dir.join("knowledge.json")
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }
}
