use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::ingest::Ingestor;
use crate::llm::chat_stream::{CompletionProvider, HttpCompletionProvider};
use crate::llm::embeddings::{Embedder, HttpEmbedder};
use crate::llm::retry::RetryPolicy;
use crate::relay::StreamRelay;
use crate::search::context::ContextAssembler;
use crate::search::vector::VectorStore;
use crate::store::{
    ChatStore, IdentityProvider, KnowledgeStore, MemoryChatStore, MemoryKnowledgeStore,
    ModelConfigProvider, ModelRegistry, StaticIdentity,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub chats: Arc<dyn ChatStore>,
    pub knowledge: Arc<dyn KnowledgeStore>,
    pub vectors: Arc<VectorStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub ingestor: Ingestor,
    pub context: ContextAssembler,
    pub relay: StreamRelay,
}

impl AppState {
    /// Open the stores under `config.data_dir` and wire the HTTP providers.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(config.vector_dir())?;

        let chats: Arc<dyn ChatStore> = Arc::new(MemoryChatStore::open(config.chats_path())?);
        let knowledge: Arc<dyn KnowledgeStore> =
            Arc::new(MemoryKnowledgeStore::open(config.knowledge_path())?);
        let vectors = Arc::new(VectorStore::open_or_create(&config.vector_dir())?);
        let registry = Arc::new(ModelRegistry::from_config(&config)?);

        // No client-wide total timeout: it would also bound how long a
        // completion may stream. Embedding requests set their own.
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(
            http_client.clone(),
            config.llm.clone(),
            RetryPolicy::from(&config.embedding),
        ));

        Ok(Self::from_parts(
            config,
            chats,
            knowledge,
            vectors,
            embedder,
            Arc::new(HttpCompletionProvider::new(http_client)),
            registry,
        ))
    }

    /// Assemble state from explicit collaborators.
    pub fn from_parts(
        config: Config,
        chats: Arc<dyn ChatStore>,
        knowledge: Arc<dyn KnowledgeStore>,
        vectors: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        provider: Arc<dyn CompletionProvider>,
        models: Arc<dyn ModelConfigProvider>,
    ) -> Self {
        let context = ContextAssembler::new(
            knowledge.clone(),
            vectors.clone(),
            embedder.clone(),
            &config.rag,
        );
        let ingestor = Ingestor::new(
            knowledge.clone(),
            vectors.clone(),
            embedder,
            config.rag.clone(),
            config.llm.embedding_model.clone(),
        );
        let relay = StreamRelay::new(
            chats.clone(),
            models,
            provider,
            context.clone(),
            config.relay.clone(),
            config.rag.context_top_k,
        );
        Self {
            identity: Arc::new(StaticIdentity::new(config.user_id.clone())),
            config,
            chats,
            knowledge,
            vectors,
            ingestor,
            context,
            relay,
        }
    }
}
