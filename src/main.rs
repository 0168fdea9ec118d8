use axum::routing::{delete, get, patch, post, put};
use axum::Router;
use tracing_subscriber::EnvFilter;

use kb_chat::api;
use kb_chat::config::Config;
use kb_chat::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("LLM provider: {} ({})", config.llm.provider, config.llm.base_url);

    let state = AppState::new(config.clone())?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route(
            "/api/knowledge-bases",
            get(api::knowledge::list_knowledge_bases).post(api::knowledge::create_knowledge_base),
        )
        .route(
            "/api/knowledge-bases/{id}",
            delete(api::knowledge::delete_knowledge_base),
        )
        .route(
            "/api/knowledge-bases/{id}/documents",
            get(api::knowledge::list_documents).post(api::knowledge::ingest_document),
        )
        .route(
            "/api/knowledge-bases/{id}/documents/{doc_id}",
            delete(api::knowledge::delete_document),
        )
        .route("/api/query", post(api::knowledge::query))
        .route("/api/chat", post(api::chat::chat))
        .route("/api/chats", get(api::chats::list_chats))
        .route(
            "/api/chats/{id}",
            get(api::chats::get_chat).delete(api::chats::delete_chat),
        )
        .route("/api/chats/{id}/branches", post(api::chats::create_branch))
        .route("/api/chats/{id}/active-branch", put(api::chats::switch_branch))
        .route(
            "/api/chats/{id}/messages/{message_id}",
            patch(api::chats::edit_message),
        )
        .with_state(state)
}
