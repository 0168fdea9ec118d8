//! # kb-chat
//!
//! A knowledge-base chat service: documents are chunked and embedded into
//! per-knowledge-base vector stores, and chat turns are answered by an LLM
//! whose streamed reply is relayed to the client while being persisted.
//!
//! ## Architecture
//!
//! ```text
//!   ingestion                                chat turn
//!   ─────────                                ─────────
//!   raw text                                 user message
//!      │                                          │
//!      ▼                                          ▼
//!  ┌──────────┐  windows  ┌──────────┐     ┌─────────────────┐
//!  │ Chunker  ├──────────►│ Embedder │◄────┤ContextAssembler │ query embedding
//!  └──────────┘           └────┬─────┘     └───────┬─────────┘
//!                              │ vectors            │ ranked hits → budgeted context
//!                              ▼                    ▼
//!                       ┌─────────────┐     ┌──────────────┐   bytes   ┌──────────┐
//!                       │ VectorStore ├────►│ StreamRelay  │◄──────────┤ provider │
//!                       └─────────────┘     └──────┬───────┘           └──────────┘
//!                                                  │ deltas (SSE)   checkpoints/seal
//!                                                  ▼                        │
//!                                               client             ChatStore + ConversationTree
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - Environment-based configuration
//! - [`error`] - `RagError` taxonomy and its HTTP status mapping
//! - [`models`] - Documents, chunks, chats, messages, branches and request types
//! - [`chunking`] - Fixed-size overlapping char windows
//! - [`llm::embeddings`] - Batched embeddings via Ollama or OpenAI-compatible APIs, with retry
//! - [`llm::chat_stream`] - Opens streaming completions against a model endpoint
//! - [`search::vector`] - Per-knowledge-base vector store with cosine similarity and disk persistence
//! - [`search::context`] - Retrieval and char-budgeted context assembly
//! - [`ingest`] - Chunk, embed and commit documents
//! - [`relay`] - Frame decoding, the stream session state machine and the turn relay
//! - [`conversation`] - Branching conversation lines
//! - [`store`] - Chat/knowledge repositories, model registry and identity
//! - [`api`] - Axum HTTP handlers
//! - [`state`] - Shared application state

pub mod api;
pub mod chunking;
pub mod config;
pub mod conversation;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod relay;
pub mod search;
pub mod state;
pub mod store;
