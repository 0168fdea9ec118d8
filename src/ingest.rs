//! Document ingestion: chunk, embed, then commit vectors and metadata.
//!
//! Nothing becomes searchable until every chunk of a document has an
//! embedding. Re-ingesting a filename retires the previous document in the
//! same vector commit that publishes the new one.
//!
//! Commits into one knowledge base are serialized, so two uploads of the
//! same filename cannot both see "no previous version" and leave one set of
//! vectors behind.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::chunking::{chunk_document, expected_chunk_count, validate};
use crate::config::RagConfig;
use crate::error::{RagError, Result};
use crate::llm::embeddings::Embedder;
use crate::models::{
    Chunk, ChunkMetadata, CreateKnowledgeBaseRequest, Document, IngestRequest, IngestResponse,
    KnowledgeBase, KnowledgeBaseSummary,
};
use crate::search::vector::VectorStore;
use crate::store::KnowledgeStore;

#[derive(Clone)]
pub struct Ingestor {
    knowledge: Arc<dyn KnowledgeStore>,
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    defaults: RagConfig,
    default_embedding_model: String,
    writers: Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>,
}

impl Ingestor {
    pub fn new(
        knowledge: Arc<dyn KnowledgeStore>,
        vectors: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        defaults: RagConfig,
        default_embedding_model: impl Into<String>,
    ) -> Self {
        Self {
            knowledge,
            vectors,
            embedder,
            defaults,
            default_embedding_model: default_embedding_model.into(),
            writers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Exclusive write access to one knowledge base's documents and vectors.
    async fn lock_kb(&self, kb_id: Uuid) -> OwnedMutexGuard<()> {
        let writer = self.writers.lock().entry(kb_id).or_default().clone();
        writer.lock_owned().await
    }

    /// Create a knowledge base, filling unset fields from the defaults.
    pub async fn create_knowledge_base(
        &self,
        owner_id: &str,
        req: CreateKnowledgeBaseRequest,
    ) -> Result<KnowledgeBase> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(RagError::config("knowledge base name is required"));
        }
        let chunk_size = req.chunk_size.unwrap_or(self.defaults.default_chunk_size);
        let chunk_overlap = req.chunk_overlap.unwrap_or(self.defaults.default_chunk_overlap);
        validate(chunk_size, chunk_overlap)?;

        let now = Utc::now();
        let kb = KnowledgeBase {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description: req.description,
            owner_id: owner_id.to_string(),
            chunk_size,
            chunk_overlap,
            embedding_model: req
                .embedding_model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| self.default_embedding_model.clone()),
            created_at: now,
            updated_at: now,
        };
        tracing::info!(
            "Creating knowledge base '{}' ({}, size={}, overlap={})",
            kb.name,
            kb.id,
            kb.chunk_size,
            kb.chunk_overlap
        );
        self.knowledge.create_knowledge_base(kb).await
    }

    /// Knowledge bases of `owner_id` with document and chunk counts.
    pub async fn list_knowledge_bases(&self, owner_id: &str) -> Result<Vec<KnowledgeBaseSummary>> {
        let counts = self.vectors.kb_counts();
        let mut summaries = Vec::new();
        for kb in self.knowledge.list_knowledge_bases(owner_id).await? {
            let document_count = self.knowledge.list_documents(kb.id).await?.len();
            let chunk_count = counts.get(&kb.id).copied().unwrap_or(0);
            summaries.push(KnowledgeBaseSummary {
                knowledge_base: kb,
                document_count,
                chunk_count,
            });
        }
        Ok(summaries)
    }

    pub async fn delete_knowledge_base(&self, kb_id: Uuid) -> Result<()> {
        let _writer = self.lock_kb(kb_id).await;
        self.knowledge.delete_knowledge_base(kb_id).await?;
        self.vectors.delete_knowledge_base(kb_id)?;
        self.writers.lock().remove(&kb_id);
        tracing::info!("Deleted knowledge base {kb_id}");
        Ok(())
    }

    /// Chunk, embed and store one document.
    pub async fn ingest(&self, kb_id: Uuid, req: IngestRequest) -> Result<IngestResponse> {
        let kb = self.knowledge.get_knowledge_base(kb_id).await?;
        let filename = req.filename.trim().to_string();
        if filename.is_empty() {
            return Err(RagError::config("filename is required"));
        }
        if req.raw_text.is_empty() {
            return Err(RagError::config(format!("{filename} has no text to ingest")));
        }

        let windows = chunk_document(&req.raw_text, kb.chunk_size, kb.chunk_overlap)?;
        let expected = expected_chunk_count(req.raw_text.chars().count(), kb.chunk_size, kb.chunk_overlap);
        if windows.len() != expected {
            return Err(RagError::config(format!(
                "chunker produced {} chunks for {filename}, expected {expected}",
                windows.len()
            )));
        }

        let texts: Vec<String> = windows.iter().map(|w| w.content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&kb.embedding_model, &texts).await?;
        if embeddings.len() != windows.len() {
            return Err(RagError::terminal(format!(
                "got {} embeddings for {} chunks",
                embeddings.len(),
                windows.len()
            )));
        }

        let document = Document {
            id: Uuid::now_v7(),
            knowledge_base_id: kb_id,
            filename: filename.clone(),
            mime_type: req.mime_type,
            size: req.raw_text.len(),
            content: req.raw_text,
            chunk_size: kb.chunk_size,
            chunk_overlap: kb.chunk_overlap,
            chunk_count: windows.len(),
            created_at: Utc::now(),
        };

        let mut metadata = ChunkMetadata::new();
        metadata.insert("filename".to_string(), document.filename.clone());
        metadata.insert("mimeType".to_string(), document.mime_type.clone());

        let chunks: Vec<Chunk> = windows
            .into_iter()
            .zip(embeddings)
            .map(|(w, embedding)| Chunk {
                id: Uuid::now_v7(),
                document_id: document.id,
                ordinal: w.ordinal,
                content: w.content,
                embedding,
                metadata: metadata.clone(),
            })
            .collect();

        let _writer = self.lock_kb(kb_id).await;
        let previous = self.knowledge.find_document(kb_id, &filename).await?;
        let previous_chunks = previous
            .as_ref()
            .map(|d| self.vectors.document_chunks(kb_id, d.id))
            .unwrap_or_default();
        let mut retired = vec![document.id];
        retired.extend(previous.as_ref().map(|d| d.id));
        self.vectors.replace_documents(kb_id, &retired, chunks)?;

        let replaced = match self.knowledge.put_document(document.clone()).await {
            Ok(replaced) => replaced,
            Err(e) => {
                tracing::error!("Failed to store document {filename}, restoring previous vectors: {e}");
                if let Err(restore) = self.vectors.replace_documents(kb_id, &[document.id], previous_chunks) {
                    tracing::error!("Vector restore for {filename} in {kb_id} failed: {restore}");
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Ingested {filename} into {kb_id}: {} chunks{}",
            document.chunk_count,
            if replaced.is_some() { " (replaced previous version)" } else { "" }
        );
        Ok(IngestResponse {
            chunk_count: document.chunk_count,
            document,
            replaced: replaced.is_some(),
        })
    }

    pub async fn list_documents(&self, kb_id: Uuid) -> Result<Vec<Document>> {
        self.knowledge.get_knowledge_base(kb_id).await?;
        self.knowledge.list_documents(kb_id).await
    }

    pub async fn delete_document(&self, kb_id: Uuid, document_id: Uuid) -> Result<Document> {
        let _writer = self.lock_kb(kb_id).await;
        let removed = self.knowledge.delete_document(kb_id, document_id).await?;
        self.vectors.delete_document(kb_id, document_id)?;
        tracing::info!("Deleted document {} from {kb_id}", removed.filename);
        Ok(removed)
    }

    pub async fn get_knowledge_base(&self, kb_id: Uuid) -> Result<KnowledgeBase> {
        self.knowledge.get_knowledge_base(kb_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKnowledgeStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store that yields inside lookups and writes, and can refuse
    /// to store documents.
    struct SlowStore {
        inner: MemoryKnowledgeStore,
        fail_puts: AtomicBool,
    }

    #[async_trait]
    impl KnowledgeStore for SlowStore {
        async fn create_knowledge_base(&self, kb: KnowledgeBase) -> Result<KnowledgeBase> {
            self.inner.create_knowledge_base(kb).await
        }
        async fn get_knowledge_base(&self, id: Uuid) -> Result<KnowledgeBase> {
            self.inner.get_knowledge_base(id).await
        }
        async fn list_knowledge_bases(&self, owner: &str) -> Result<Vec<KnowledgeBase>> {
            self.inner.list_knowledge_bases(owner).await
        }
        async fn delete_knowledge_base(&self, id: Uuid) -> Result<()> {
            self.inner.delete_knowledge_base(id).await
        }
        async fn put_document(&self, d: Document) -> Result<Option<Document>> {
            tokio::task::yield_now().await;
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(RagError::persistence("disk full"));
            }
            self.inner.put_document(d).await
        }
        async fn find_document(&self, kb: Uuid, filename: &str) -> Result<Option<Document>> {
            tokio::task::yield_now().await;
            self.inner.find_document(kb, filename).await
        }
        async fn list_documents(&self, kb: Uuid) -> Result<Vec<Document>> {
            self.inner.list_documents(kb).await
        }
        async fn delete_document(&self, kb: Uuid, id: Uuid) -> Result<Document> {
            self.inner.delete_document(kb, id).await
        }
    }

    fn slow_ingestor() -> (Ingestor, Arc<SlowStore>, Arc<VectorStore>) {
        let store = Arc::new(SlowStore {
            inner: MemoryKnowledgeStore::in_memory(),
            fail_puts: AtomicBool::new(false),
        });
        let vectors = Arc::new(VectorStore::in_memory());
        let ingestor = Ingestor::new(
            store.clone(),
            vectors.clone(),
            Arc::new(StubEmbedder {
                fail: AtomicBool::new(false),
            }),
            RagConfig::default(),
            "nomic-embed-text",
        );
        (ingestor, store, vectors)
    }

    /// Embeds text as `[len, vowel count]`; fails on demand.
    struct StubEmbedder {
        fail: AtomicBool,
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed_batch(&self, _model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RagError::terminal("provider down"));
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let vowels = t.chars().filter(|c| "aeiou".contains(*c)).count();
                    vec![t.chars().count() as f32, vowels as f32 + 1.0]
                })
                .collect())
        }
    }

    fn ingestor() -> (Ingestor, Arc<VectorStore>, Arc<StubEmbedder>) {
        let vectors = Arc::new(VectorStore::in_memory());
        let embedder = Arc::new(StubEmbedder {
            fail: AtomicBool::new(false),
        });
        let ingestor = Ingestor::new(
            Arc::new(MemoryKnowledgeStore::in_memory()),
            vectors.clone(),
            embedder.clone(),
            RagConfig::default(),
            "nomic-embed-text",
        );
        (ingestor, vectors, embedder)
    }

    fn kb_request(size: usize, overlap: usize) -> CreateKnowledgeBaseRequest {
        CreateKnowledgeBaseRequest {
            name: "docs".into(),
            description: None,
            chunk_size: Some(size),
            chunk_overlap: Some(overlap),
            embedding_model: None,
        }
    }

    fn ingest_request(filename: &str, text: &str) -> IngestRequest {
        IngestRequest {
            filename: filename.into(),
            mime_type: "text/plain".into(),
            raw_text: text.into(),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_bad_chunk_params() {
        let (ingestor, _, _) = ingestor();
        let err = ingestor.create_knowledge_base("u1", kb_request(10, 10)).await.unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[tokio::test]
    async fn test_ingest_chunks_embeds_and_indexes() {
        let (ingestor, vectors, _) = ingestor();
        let kb = ingestor.create_knowledge_base("u1", kb_request(10, 3)).await.unwrap();
        let resp = ingestor
            .ingest(kb.id, ingest_request("fox.txt", "The quick brown fox jumps."))
            .await
            .unwrap();
        assert_eq!(resp.chunk_count, 4);
        assert!(!resp.replaced);
        assert_eq!(vectors.kb_counts().get(&kb.id), Some(&4));

        let summaries = ingestor.list_knowledge_bases("u1").await.unwrap();
        assert_eq!(summaries[0].document_count, 1);
        assert_eq!(summaries[0].chunk_count, 4);
    }

    #[tokio::test]
    async fn test_reingest_replaces_previous_document() {
        let (ingestor, vectors, _) = ingestor();
        let kb = ingestor.create_knowledge_base("u1", kb_request(10, 3)).await.unwrap();
        let first = ingestor
            .ingest(kb.id, ingest_request("a.txt", "The quick brown fox jumps."))
            .await
            .unwrap();
        let second = ingestor.ingest(kb.id, ingest_request("a.txt", "short")).await.unwrap();

        assert!(second.replaced);
        assert_ne!(first.document.id, second.document.id);
        assert_eq!(vectors.kb_counts().get(&kb.id), Some(&1));
        let docs = ingestor.list_documents(kb.id).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "short");
    }

    #[tokio::test]
    async fn test_failed_embedding_commits_nothing() {
        let (ingestor, vectors, embedder) = ingestor();
        let kb = ingestor.create_knowledge_base("u1", kb_request(10, 3)).await.unwrap();
        ingestor.ingest(kb.id, ingest_request("a.txt", "original text")).await.unwrap();

        embedder.fail.store(true, Ordering::SeqCst);
        let err = ingestor
            .ingest(kb.id, ingest_request("a.txt", "replacement that never lands"))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Provider { .. }));

        let docs = ingestor.list_documents(kb.id).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "original text");
        assert_eq!(vectors.kb_counts().get(&kb.id), Some(&2));
    }

    #[tokio::test]
    async fn test_failed_document_write_restores_previous_vectors() {
        let (ingestor, store, vectors) = slow_ingestor();
        let kb = ingestor.create_knowledge_base("u1", kb_request(10, 3)).await.unwrap();
        let first = ingestor
            .ingest(kb.id, ingest_request("a.txt", "original text"))
            .await
            .unwrap();
        let before = vectors.document_chunks(kb.id, first.document.id);
        assert_eq!(before.len(), 2);

        store.fail_puts.store(true, Ordering::SeqCst);
        let err = ingestor
            .ingest(kb.id, ingest_request("a.txt", "a replacement that is not stored"))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Persistence(_)));

        let docs = ingestor.list_documents(kb.id).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, first.document.id);
        let after = vectors.document_chunks(kb.id, first.document.id);
        let chunk_ids = |chunks: Vec<Chunk>| chunks.into_iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(chunk_ids(after), chunk_ids(before));
        assert_eq!(vectors.kb_counts().get(&kb.id), Some(&2));

        // a first upload that cannot be stored leaves no vectors at all
        let err = ingestor.ingest(kb.id, ingest_request("b.txt", "brand new")).await;
        assert!(err.is_err());
        assert_eq!(vectors.kb_counts().get(&kb.id), Some(&2));
    }

    #[tokio::test]
    async fn test_concurrent_reingest_leaves_one_version() {
        let (ingestor, _, vectors) = slow_ingestor();
        let kb = ingestor.create_knowledge_base("u1", kb_request(10, 3)).await.unwrap();

        let (a, b) = tokio::join!(
            ingestor.ingest(kb.id, ingest_request("a.txt", "The quick brown fox jumps.")),
            ingestor.ingest(kb.id, ingest_request("a.txt", "short")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.replaced != b.replaced);

        let docs = ingestor.list_documents(kb.id).await.unwrap();
        assert_eq!(docs.len(), 1);
        let survivor = &docs[0];
        assert_eq!(vectors.kb_counts().get(&kb.id), Some(&survivor.chunk_count));
        let hits = vectors.search(kb.id, &[1.0, 1.0], 10).unwrap();
        assert!(hits.iter().all(|h| h.document_id == survivor.id));
    }

    #[tokio::test]
    async fn test_ingest_unknown_kb_and_empty_text() {
        let (ingestor, _, _) = ingestor();
        assert!(matches!(
            ingestor.ingest(Uuid::now_v7(), ingest_request("a.txt", "x")).await,
            Err(RagError::NotFound(_))
        ));
        let kb = ingestor.create_knowledge_base("u1", kb_request(10, 3)).await.unwrap();
        assert!(matches!(
            ingestor.ingest(kb.id, ingest_request("a.txt", "")).await,
            Err(RagError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_document_and_knowledge_base() {
        let (ingestor, vectors, _) = ingestor();
        let kb = ingestor.create_knowledge_base("u1", kb_request(10, 3)).await.unwrap();
        let resp = ingestor.ingest(kb.id, ingest_request("a.txt", "some text here")).await.unwrap();
        ingestor.ingest(kb.id, ingest_request("b.txt", "other")).await.unwrap();

        ingestor.delete_document(kb.id, resp.document.id).await.unwrap();
        assert_eq!(vectors.kb_counts().get(&kb.id), Some(&1));

        ingestor.delete_knowledge_base(kb.id).await.unwrap();
        assert_eq!(vectors.entry_count(), 0);
        assert!(ingestor.get_knowledge_base(kb.id).await.is_err());
    }
}
