use std::fmt::Write;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::RagConfig;
use crate::error::{RagError, Result};
use crate::llm::embeddings::Embedder;
use crate::models::ChunkHit;
use crate::search::vector::VectorStore;
use crate::store::KnowledgeStore;

/// Retrieves ranked chunks for a query and turns them into a bounded
/// context block for the system prompt.
#[derive(Clone)]
pub struct ContextAssembler {
    knowledge: Arc<dyn KnowledgeStore>,
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    char_budget: usize,
    tag_sources: bool,
}

impl ContextAssembler {
    pub fn new(
        knowledge: Arc<dyn KnowledgeStore>,
        vectors: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        config: &RagConfig,
    ) -> Self {
        Self {
            knowledge,
            vectors,
            embedder,
            char_budget: config.context_char_budget,
            tag_sources: config.tag_sources,
        }
    }

    /// Embed `query` with the knowledge base's model and search it.
    pub async fn retrieve(&self, kb_id: Uuid, query: &str, top_k: usize) -> Result<Vec<ChunkHit>> {
        if top_k == 0 {
            return Err(RagError::config("topK must be at least 1"));
        }
        let kb = self.knowledge.get_knowledge_base(kb_id).await?;
        if self.vectors.dimension(kb_id).is_none() {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed(&kb.embedding_model, query).await?;
        self.vectors.search(kb_id, &embedding, top_k)
    }

    /// Context block for a chat turn. Empty when there is no knowledge
    /// base, nothing matches, or retrieval fails.
    pub async fn build_context(&self, kb_id: Option<Uuid>, query: &str, top_k: usize) -> String {
        let Some(kb_id) = kb_id else {
            return String::new();
        };
        match self.retrieve(kb_id, query, top_k).await {
            Ok(hits) => {
                tracing::info!("Retrieved {} context chunks from knowledge base {kb_id}", hits.len());
                assemble(&hits, self.char_budget, self.tag_sources)
            }
            Err(RagError::NotFound(_)) => {
                tracing::warn!("Knowledge base {kb_id} not found, answering without context");
                String::new()
            }
            Err(e) => {
                tracing::warn!("Context retrieval failed, answering without context: {e}");
                String::new()
            }
        }
    }
}

/// Join ranked hits into one block of at most `char_budget` chars. Hits are
/// kept in rank order and the first one that no longer fits ends the block;
/// a top hit that alone exceeds the budget is cut short.
pub fn assemble(hits: &[ChunkHit], char_budget: usize, tag_sources: bool) -> String {
    let mut out = String::new();
    let mut used = 0;

    for (rank, hit) in hits.iter().enumerate() {
        let block = format_block(hit, tag_sources);
        let separator = if rank == 0 { 0 } else { 2 };
        let len = block.chars().count();

        if used + separator + len <= char_budget {
            if rank > 0 {
                out.push_str("\n\n");
            }
            out.push_str(&block);
            used += separator + len;
        } else {
            if rank == 0 {
                out.extend(block.chars().take(char_budget));
            }
            break;
        }
    }
    out
}

fn format_block(hit: &ChunkHit, tag_sources: bool) -> String {
    if !tag_sources {
        return hit.content.clone();
    }
    let mut block = String::with_capacity(hit.content.len() + 64);
    match hit.metadata.get("filename") {
        Some(filename) => {
            let _ = writeln!(block, "[source: {} ({filename})]", hit.document_id);
        }
        None => {
            let _ = writeln!(block, "[source: {}]", hit.document_id);
        }
    }
    block.push_str(&hit.content);
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn hit(content: &str, score: f32) -> ChunkHit {
        let mut metadata = ChunkMetadata::new();
        metadata.insert("filename".into(), "notes.md".into());
        ChunkHit {
            chunk_id: Uuid::now_v7(),
            document_id: Uuid::now_v7(),
            ordinal: 0,
            score,
            content: content.into(),
            metadata,
        }
    }

    #[test]
    fn test_empty_hits_give_empty_context() {
        assert_eq!(assemble(&[], 100, true), "");
    }

    #[test]
    fn test_untagged_blocks_in_rank_order() {
        let hits = vec![hit("first", 0.9), hit("second", 0.5)];
        assert_eq!(assemble(&hits, 100, false), "first\n\nsecond");
    }

    #[test]
    fn test_source_tag_names_document() {
        let hits = vec![hit("body", 0.9)];
        let ctx = assemble(&hits, 500, true);
        assert!(ctx.starts_with(&format!("[source: {} (notes.md)]\n", hits[0].document_id)));
        assert!(ctx.ends_with("body"));
    }

    #[test]
    fn test_budget_drops_lowest_ranked_first() {
        let hits = vec![hit("aaaa", 0.9), hit("bbbb", 0.8), hit("cc", 0.7)];
        // "aaaa" + "\n\n" + "bbbb" = 10 chars; "cc" would need 4 more
        assert_eq!(assemble(&hits, 12, false), "aaaa\n\nbbbb");
        assert_eq!(assemble(&hits, 9, false), "aaaa");
    }

    #[test]
    fn test_lower_ranked_hit_never_replaces_dropped_one() {
        let hits = vec![hit("aaaa", 0.9), hit("bbbbbbbbbb", 0.8), hit("c", 0.7)];
        assert_eq!(assemble(&hits, 9, false), "aaaa");
    }

    #[test]
    fn test_oversized_top_hit_truncated_on_char_boundary() {
        let hits = vec![hit("ünïcödé text", 0.9)];
        let ctx = assemble(&hits, 5, false);
        assert_eq!(ctx, "ünïcö");
    }
}
