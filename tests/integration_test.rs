//! Integration tests for the knowledge-base chat pipeline.
//!
//! These wire the real stores, ingestor, context assembler and relay
//! together with a keyword embedder and a scripted completion provider, so
//! no LLM needs to be running.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

use kb_chat::config::Config;
use kb_chat::error::Result;
use kb_chat::llm::chat_stream::{ByteStream, CompletionProvider, CompletionRequest};
use kb_chat::llm::embeddings::Embedder;
use kb_chat::models::{
    ChatMessage, ChatTarget, ChatTurnRequest, CreateKnowledgeBaseRequest, IngestRequest,
    MessageStatus, ModelParameters, Role,
};
use kb_chat::relay::{RelayEvent, TurnHandle};
use kb_chat::search::vector::VectorStore;
use kb_chat::state::AppState;
use kb_chat::store::{
    ChatStore, MemoryChatStore, MemoryKnowledgeStore, ModelRegistry, UserIdentity,
};

/// Embeds text as keyword counts over a tiny fixed vocabulary.
struct KeywordEmbedder;

const VOCAB: [&str; 3] = ["apple", "engine", "river"];

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed_batch(&self, _model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                VOCAB
                    .iter()
                    .map(|w| lower.matches(w).count() as f32 + 0.01)
                    .collect()
            })
            .collect())
    }
}

/// Streams a fixed Ollama-style reply and remembers what it was asked.
struct EchoProvider {
    reply: Vec<&'static str>,
    requests: Mutex<Vec<CompletionRequest>>,
}

#[async_trait]
impl CompletionProvider for EchoProvider {
    async fn open(
        &self,
        _endpoint: &kb_chat::store::ModelEndpoint,
        request: &CompletionRequest,
    ) -> Result<ByteStream> {
        self.requests.lock().push(request.clone());
        let mut lines: Vec<Result<Bytes>> = self
            .reply
            .iter()
            .map(|piece| {
                let line = serde_json::json!({
                    "message": {"role": "assistant", "content": piece},
                    "done": false,
                });
                Ok(Bytes::from(format!("{line}\n")))
            })
            .collect();
        lines.push(Ok(Bytes::from_static(b"{\"done\":true}\n")));
        Ok(Box::pin(stream::iter(lines)))
    }
}

fn app(reply: Vec<&'static str>) -> (AppState, Arc<EchoProvider>) {
    let config = Config::default();
    let provider = Arc::new(EchoProvider {
        reply,
        requests: Mutex::new(Vec::new()),
    });
    let registry = ModelRegistry::from_config(&config).unwrap();
    let state = AppState::from_parts(
        config,
        Arc::new(MemoryChatStore::in_memory()),
        Arc::new(MemoryKnowledgeStore::in_memory()),
        Arc::new(VectorStore::in_memory()),
        Arc::new(KeywordEmbedder),
        provider.clone(),
        Arc::new(registry),
    );
    (state, provider)
}

fn user() -> UserIdentity {
    UserIdentity { id: "local".into() }
}

fn turn(chat_id: ChatTarget, kb_id: Option<Uuid>, text: &str) -> ChatTurnRequest {
    ChatTurnRequest {
        prior_messages: vec![ChatMessage {
            role: "user".into(),
            content: text.into(),
        }],
        chat_id,
        model_id: "default".into(),
        kb_id,
        show_reasoning_trace: false,
        parameters: ModelParameters::default(),
    }
}

async fn drain(mut handle: TurnHandle) -> Vec<RelayEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        events.push(event);
    }
    events
}

async fn knowledge_base_with_docs(state: &AppState) -> Uuid {
    let kb = state
        .ingestor
        .create_knowledge_base(
            "local",
            CreateKnowledgeBaseRequest {
                name: "notes".into(),
                description: None,
                chunk_size: Some(200),
                chunk_overlap: Some(20),
                embedding_model: None,
            },
        )
        .await
        .unwrap();
    for (filename, text) in [
        ("fruit.txt", "An apple a day. Apple trees grow apple fruit."),
        ("cars.txt", "The engine turns the crankshaft; a diesel engine is loud."),
        ("geo.txt", "The river flows to the sea."),
    ] {
        state
            .ingestor
            .ingest(
                kb.id,
                IngestRequest {
                    filename: filename.into(),
                    mime_type: "text/plain".into(),
                    raw_text: text.into(),
                },
            )
            .await
            .unwrap();
    }
    kb.id
}

#[tokio::test]
async fn test_end_to_end_ingest_and_query() {
    let (state, _) = app(vec![]);
    let kb_id = knowledge_base_with_docs(&state).await;

    let hits = state.context.retrieve(kb_id, "tell me about the engine", 2).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].metadata.get("filename").map(String::as_str), Some("cars.txt"));
    assert!(hits[0].score >= hits[1].score);

    let listed = state.ingestor.list_knowledge_bases("local").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].document_count, 3);
    assert_eq!(listed[0].chunk_count, 3);
}

#[tokio::test]
async fn test_end_to_end_chat_turn_with_context() {
    let (state, provider) = app(vec!["Apples ", "are fruit."]);
    let kb_id = knowledge_base_with_docs(&state).await;

    let handle = state
        .relay
        .start(&user(), turn(ChatTarget::New, Some(kb_id), "what is an apple?"))
        .await
        .unwrap();
    let chat_id = handle.chat_id;
    let events = drain(handle).await;

    assert_eq!(events[0], RelayEvent::Delta("Apples ".into()));
    assert_eq!(events[1], RelayEvent::Delta("are fruit.".into()));
    assert_eq!(events[2], RelayEvent::Done);
    assert!(matches!(&events[3], RelayEvent::Message(m) if m.content == "Apples are fruit."));

    let sent = provider.requests.lock()[0].clone();
    let system = &sent.messages[0];
    assert_eq!(system.role, "system");
    assert!(system.content.contains("Apple trees grow apple fruit."));
    assert!(system.content.contains("[source: "));

    let history = state.chats.history(chat_id).await.unwrap();
    assert_eq!(history.messages.len(), 2);
    assert_eq!(history.messages[1].status, MessageStatus::Complete);

    // the chat remembers its knowledge base for later turns
    let chat = state.chats.get_chat(chat_id).await.unwrap();
    assert_eq!(chat.knowledge_base_id, Some(kb_id));
}

#[tokio::test]
async fn test_end_to_end_branch_and_edit() {
    let (state, _) = app(vec!["ok"]);

    let first = drain(
        state
            .relay
            .start(&user(), turn(ChatTarget::New, None, "first question"))
            .await
            .unwrap(),
    )
    .await;
    let RelayEvent::Message(reply) = first.last().cloned().unwrap() else {
        panic!("turn did not end with a message");
    };
    let chat_id = reply.chat_id;

    let branch = state
        .chats
        .create_branch(chat_id, reply.id, "alt", true)
        .await
        .unwrap();
    drain(
        state
            .relay
            .start(&user(), turn(ChatTarget::Existing(chat_id), None, "on the branch"))
            .await
            .unwrap(),
    )
    .await;

    let on_branch = state.chats.history(chat_id).await.unwrap();
    assert_eq!(on_branch.active_branch_id, Some(branch.id));
    assert_eq!(on_branch.messages.len(), 4);

    state.chats.switch_branch(chat_id, None).await.unwrap();
    let main = state.chats.history(chat_id).await.unwrap();
    assert_eq!(main.messages.len(), 2);

    // the first user message is shared by both lines, so editing it on the
    // main line must leave the branch untouched
    let original = main.messages[0].clone();
    assert_eq!(original.role, Role::User);
    let edited = state
        .chats
        .edit_message(chat_id, original.id, "first question, reworded")
        .await
        .unwrap();
    assert_ne!(edited.id, original.id);

    let main = state.chats.history(chat_id).await.unwrap();
    assert_eq!(main.messages[0].content, "first question, reworded");

    state.chats.switch_branch(chat_id, Some(branch.id)).await.unwrap();
    let on_branch = state.chats.history(chat_id).await.unwrap();
    assert_eq!(on_branch.messages[0].content, "first question");
    assert_eq!(on_branch.messages[0].id, original.id);
}

#[tokio::test]
async fn test_end_to_end_persistence_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let chats_path = dir.path().join("chats.json");

    let chat_id = {
        let store = MemoryChatStore::open(chats_path.clone()).unwrap();
        let chat = store.create_chat("local", "t", "default", None).await.unwrap();
        store
            .append_message(chat.id, Role::User, "hello", MessageStatus::Complete)
            .await
            .unwrap();
        chat.id
    };

    let reopened = MemoryChatStore::open(chats_path).unwrap();
    let history = reopened.history(chat_id).await.unwrap();
    assert_eq!(history.messages.len(), 1);
    assert_eq!(history.messages[0].content, "hello");

    let vectors_dir = dir.path().join("vectors");
    let kb_id = Uuid::now_v7();
    {
        let vectors = VectorStore::open_or_create(&vectors_dir).unwrap();
        let doc_id = Uuid::now_v7();
        let chunk = kb_chat::models::Chunk {
            id: Uuid::now_v7(),
            document_id: doc_id,
            ordinal: 0,
            content: "persisted".into(),
            embedding: vec![1.0, 0.0],
            metadata: Default::default(),
        };
        vectors.replace_document(kb_id, doc_id, vec![chunk]).unwrap();
    }
    let vectors = VectorStore::open_or_create(&vectors_dir).unwrap();
    let hits = vectors.search(kb_id, &[1.0, 0.0], 1).unwrap();
    assert_eq!(hits[0].content, "persisted");
}
