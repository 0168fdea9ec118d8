//! Retrieval: the per-knowledge-base vector store and prompt context assembly.

pub mod context;
pub mod vector;
