use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::models::{Chunk, ChunkHit, ChunkMetadata};
use crate::store::write_json_atomic;

/// A stored vector entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VectorEntry {
    chunk_id: Uuid,
    document_id: Uuid,
    ordinal: usize,
    content: String,
    metadata: ChunkMetadata,
    embedding: Vec<f32>,
}

impl VectorEntry {
    fn to_chunk(&self) -> Chunk {
        Chunk {
            id: self.chunk_id,
            document_id: self.document_id,
            ordinal: self.ordinal,
            content: self.content.clone(),
            embedding: self.embedding.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl From<Chunk> for VectorEntry {
    fn from(c: Chunk) -> Self {
        Self {
            chunk_id: c.id,
            document_id: c.document_id,
            ordinal: c.ordinal,
            content: c.content,
            metadata: c.metadata,
            embedding: c.embedding,
        }
    }
}

/// All vectors of one knowledge base. `dim` is fixed by the first commit;
/// a base left with no entries is dropped, which resets it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KbVectors {
    dim: Option<usize>,
    entries: Vec<VectorEntry>,
}

impl KbVectors {
    fn check_dim(&self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(RagError::config("embedding vector is empty"));
        }
        match self.dim {
            Some(dim) if dim != len => Err(RagError::config(format!(
                "embedding dimension mismatch: knowledge base uses {dim}, got {len}"
            ))),
            _ => Ok(()),
        }
    }
}

/// In-memory vector store partitioned by knowledge base, with optional disk
/// persistence and cosine similarity search.
///
/// Every write happens under one write lock, so a search sees either all of
/// a commit or none of it. A commit that cannot be persisted is undone
/// before the lock is released.
pub struct VectorStore {
    kbs: RwLock<HashMap<Uuid, KbVectors>>,
    persist_path: Option<PathBuf>,
}

impl VectorStore {
    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            kbs: RwLock::new(HashMap::new()),
            persist_path: None,
        }
    }

    pub fn open_or_create(vector_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(vector_dir)
            .map_err(|e| RagError::persistence(format!("create {}: {e}", vector_dir.display())))?;
        let persist_path = vector_dir.join("vectors.json");

        let kbs = if persist_path.exists() {
            let data = std::fs::read_to_string(&persist_path)
                .map_err(|e| RagError::persistence(format!("read vector store: {e}")))?;
            serde_json::from_str(&data).unwrap_or_else(|e| {
                tracing::warn!("Vector store at {} is unreadable, starting empty: {e}", persist_path.display());
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        Ok(Self {
            kbs: RwLock::new(kbs),
            persist_path: Some(persist_path),
        })
    }

    /// Apply `change` to a copy of one knowledge base's vectors, then swap
    /// the copy in and persist. On a persist failure the previous vectors are
    /// put back.
    fn commit(&self, kb_id: Uuid, change: impl FnOnce(&mut KbVectors) -> Result<()>) -> Result<()> {
        let mut kbs = self.kbs.write();
        let mut next = kbs.get(&kb_id).cloned().unwrap_or_default();
        change(&mut next)?;

        let previous = if next.entries.is_empty() {
            kbs.remove(&kb_id)
        } else {
            kbs.insert(kb_id, next)
        };
        if let Err(e) = self.persist(&kbs) {
            match previous {
                Some(previous) => kbs.insert(kb_id, previous),
                None => kbs.remove(&kb_id),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Insert or replace a single chunk vector.
    pub fn upsert(&self, kb_id: Uuid, chunk: Chunk) -> Result<()> {
        self.commit(kb_id, |kb| {
            kb.check_dim(chunk.embedding.len())?;
            kb.dim = Some(chunk.embedding.len());
            let entry = VectorEntry::from(chunk);
            match kb.entries.iter_mut().find(|e| e.chunk_id == entry.chunk_id) {
                Some(existing) => *existing = entry,
                None => kb.entries.push(entry),
            }
            Ok(())
        })
    }

    /// Swap every chunk of `document_id` for `chunks` in a single commit.
    /// Nothing is written if any vector has the wrong dimension.
    pub fn replace_document(&self, kb_id: Uuid, document_id: Uuid, chunks: Vec<Chunk>) -> Result<()> {
        self.replace_documents(kb_id, &[document_id], chunks)
    }

    /// Drop every chunk of the `removed` documents and insert `chunks`, as
    /// one commit. Re-ingestion uses this to retire the previous version of
    /// a document in the same step that makes the new one searchable.
    pub fn replace_documents(&self, kb_id: Uuid, removed: &[Uuid], chunks: Vec<Chunk>) -> Result<()> {
        self.commit(kb_id, |kb| {
            // Dimension is checked against the base as it will look after
            // the removed documents' entries are gone.
            let others_dim = if kb.entries.iter().any(|e| !removed.contains(&e.document_id)) {
                kb.dim
            } else {
                None
            };
            let dim = others_dim.or_else(|| chunks.first().map(|c| c.embedding.len()));
            let expected = KbVectors {
                dim,
                entries: Vec::new(),
            };
            for c in &chunks {
                expected.check_dim(c.embedding.len())?;
            }

            kb.entries.retain(|e| !removed.contains(&e.document_id));
            kb.entries.extend(chunks.into_iter().map(VectorEntry::from));
            kb.dim = if kb.entries.is_empty() { None } else { dim };
            Ok(())
        })
    }

    /// The stored chunks of one document, in ordinal order.
    pub fn document_chunks(&self, kb_id: Uuid, document_id: Uuid) -> Vec<Chunk> {
        let kbs = self.kbs.read();
        let mut chunks: Vec<Chunk> = kbs
            .get(&kb_id)
            .map(|kb| {
                kb.entries
                    .iter()
                    .filter(|e| e.document_id == document_id)
                    .map(VectorEntry::to_chunk)
                    .collect()
            })
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.ordinal);
        chunks
    }

    /// Delete all vectors for a document.
    pub fn delete_document(&self, kb_id: Uuid, document_id: Uuid) -> Result<()> {
        if !self.kbs.read().contains_key(&kb_id) {
            return Ok(());
        }
        self.commit(kb_id, |kb| {
            kb.entries.retain(|e| e.document_id != document_id);
            if kb.entries.is_empty() {
                kb.dim = None;
            }
            Ok(())
        })
    }

    /// Delete all vectors for a knowledge base.
    pub fn delete_knowledge_base(&self, kb_id: Uuid) -> Result<()> {
        let mut kbs = self.kbs.write();
        let Some(removed) = kbs.remove(&kb_id) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&kbs) {
            kbs.insert(kb_id, removed);
            return Err(e);
        }
        Ok(())
    }

    /// Rank the chunks of one knowledge base by cosine similarity to
    /// `query`. Ties go to the lower ordinal, then the earlier document id.
    pub fn search(&self, kb_id: Uuid, query: &[f32], top_k: usize) -> Result<Vec<ChunkHit>> {
        if top_k == 0 {
            return Err(RagError::config("topK must be at least 1"));
        }

        let kbs = self.kbs.read();
        let Some(kb) = kbs.get(&kb_id) else {
            return Ok(Vec::new());
        };
        if kb.entries.is_empty() {
            return Ok(Vec::new());
        }
        kb.check_dim(query.len())?;

        let mut scored: Vec<(f32, &VectorEntry)> = kb
            .entries
            .iter()
            .map(|e| (cosine_similarity(query, &e.embedding), e))
            .collect();

        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.ordinal.cmp(&b.1.ordinal))
                .then_with(|| a.1.document_id.cmp(&b.1.document_id))
        });
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(score, e)| ChunkHit {
                chunk_id: e.chunk_id,
                document_id: e.document_id,
                ordinal: e.ordinal,
                score,
                content: e.content.clone(),
                metadata: e.metadata.clone(),
            })
            .collect())
    }

    /// Embedding dimension established for a knowledge base.
    pub fn dimension(&self, kb_id: Uuid) -> Option<usize> {
        self.kbs.read().get(&kb_id).and_then(|kb| kb.dim)
    }

    pub fn entry_count(&self) -> usize {
        self.kbs.read().values().map(|kb| kb.entries.len()).sum()
    }

    /// Get counts grouped by knowledge base.
    pub fn kb_counts(&self) -> HashMap<Uuid, usize> {
        self.kbs
            .read()
            .iter()
            .map(|(id, kb)| (*id, kb.entries.len()))
            .collect()
    }

    /// Persist atomically via temp file + rename. Called with the write lock
    /// held so concurrent commits reach disk in order.
    fn persist(&self, kbs: &HashMap<Uuid, KbVectors>) -> Result<()> {
        match &self.persist_path {
            Some(path) => write_json_atomic(path, kbs),
            None => Ok(()),
        }
    }
}

/// Cosine similarity in [-1, 1]; 0 when either vector has zero norm or the
/// lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 || !denom.is_finite() {
        0.0
    } else {
        (dot / denom).clamp(-1.0, 1.0)
    }
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("entries", &self.entry_count())
            .field("persist_path", &self.persist_path)
            .finish()
    }
}
