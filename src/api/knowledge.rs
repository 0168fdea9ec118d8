use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::api::{current_user, ensure_owner};
use crate::error::api_error;
use crate::models::{
    CreateKnowledgeBaseRequest, Document, IngestRequest, IngestResponse, KnowledgeBase,
    KnowledgeBaseSummary, QueryRequest, QueryResponse,
};
use crate::state::AppState;

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Load a knowledge base and check the current user owns it.
async fn owned_kb(state: &AppState, kb_id: Uuid) -> ApiResult<KnowledgeBase> {
    let user = current_user(state).await?;
    let kb = state.ingestor.get_knowledge_base(kb_id).await.map_err(api_error)?;
    ensure_owner(&user, &kb.owner_id, format!("knowledge base {kb_id}"))?;
    Ok(kb)
}

/// POST /api/knowledge-bases - Create a knowledge base
pub async fn create_knowledge_base(
    State(state): State<AppState>,
    Json(req): Json<CreateKnowledgeBaseRequest>,
) -> ApiResult<(StatusCode, Json<KnowledgeBase>)> {
    let user = current_user(&state).await?;
    let kb = state
        .ingestor
        .create_knowledge_base(&user.id, req)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(kb)))
}

/// GET /api/knowledge-bases - Knowledge bases of the current user with counts
pub async fn list_knowledge_bases(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<KnowledgeBaseSummary>>> {
    let user = current_user(&state).await?;
    let kbs = state
        .ingestor
        .list_knowledge_bases(&user.id)
        .await
        .map_err(api_error)?;
    Ok(Json(kbs))
}

/// DELETE /api/knowledge-bases/{id} - Remove a knowledge base, its documents and vectors
pub async fn delete_knowledge_base(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    owned_kb(&state, id).await?;
    state.ingestor.delete_knowledge_base(id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/knowledge-bases/{id}/documents - Chunk, embed and store a document
pub async fn ingest_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<IngestRequest>,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    owned_kb(&state, id).await?;
    let response = state.ingestor.ingest(id, req).await.map_err(|e| {
        tracing::error!("Ingestion into {id} failed: {e}");
        api_error(e)
    })?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /api/knowledge-bases/{id}/documents
pub async fn list_documents(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Document>>> {
    owned_kb(&state, id).await?;
    let docs = state.ingestor.list_documents(id).await.map_err(api_error)?;
    Ok(Json(docs))
}

/// DELETE /api/knowledge-bases/{id}/documents/{doc_id}
pub async fn delete_document(
    State(state): State<AppState>,
    Path((id, doc_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    owned_kb(&state, id).await?;
    state
        .ingestor
        .delete_document(id, doc_id)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/query - Ranked chunks of one knowledge base for a query
pub async fn query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<Json<QueryResponse>> {
    let query_text = req.query_text.trim().to_string();
    if query_text.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "queryText is required".to_string()));
    }
    owned_kb(&state, req.kb_id).await?;

    let results = state
        .context
        .retrieve(req.kb_id, &query_text, req.top_k)
        .await
        .map_err(api_error)?;
    tracing::info!("Query on {} returned {} chunks", req.kb_id, results.len());
    Ok(Json(QueryResponse { query_text, results }))
}
