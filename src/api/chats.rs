use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::api::{current_user, ensure_owner};
use crate::error::api_error;
use crate::models::{
    Branch, Chat, ChatHistory, ChatSummary, CreateBranchRequest, EditMessageRequest, Message,
    SwitchBranchRequest,
};
use crate::state::AppState;

type ApiResult<T> = Result<T, (StatusCode, String)>;

async fn owned_chat(state: &AppState, chat_id: Uuid) -> ApiResult<Chat> {
    let user = current_user(state).await?;
    let chat = state.chats.get_chat(chat_id).await.map_err(api_error)?;
    ensure_owner(&user, &chat.user_id, format!("chat {chat_id}"))?;
    Ok(chat)
}

/// GET /api/chats - Current user's chats, most recently updated first
pub async fn list_chats(State(state): State<AppState>) -> ApiResult<Json<Vec<ChatSummary>>> {
    let user = current_user(&state).await?;
    let chats = state.chats.list_chats(&user.id).await.map_err(api_error)?;
    Ok(Json(chats))
}

/// GET /api/chats/{id} - Chat with the messages of its active line
pub async fn get_chat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ChatHistory>> {
    owned_chat(&state, id).await?;
    let history = state.chats.history(id).await.map_err(api_error)?;
    Ok(Json(history))
}

/// DELETE /api/chats/{id}
pub async fn delete_chat(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    owned_chat(&state, id).await?;
    state.chats.delete_chat(id).await.map_err(api_error)?;
    tracing::info!("Deleted chat {id}");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/chats/{id}/branches - Fork the active line at a message
pub async fn create_branch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateBranchRequest>,
) -> ApiResult<(StatusCode, Json<Branch>)> {
    owned_chat(&state, id).await?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Branch name is required".to_string()));
    }
    let branch = state
        .chats
        .create_branch(id, req.source_message_id, name, req.activate)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(branch)))
}

/// PUT /api/chats/{id}/active-branch - Switch lines; `null` selects the main line
pub async fn switch_branch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SwitchBranchRequest>,
) -> ApiResult<Json<ChatHistory>> {
    owned_chat(&state, id).await?;
    state
        .chats
        .switch_branch(id, req.branch_id)
        .await
        .map_err(api_error)?;
    let history = state.chats.history(id).await.map_err(api_error)?;
    Ok(Json(history))
}

/// PATCH /api/chats/{id}/messages/{message_id} - Edit a message on the active line
pub async fn edit_message(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<Json<Message>> {
    owned_chat(&state, id).await?;
    let message = state
        .chats
        .edit_message(id, message_id, &req.content)
        .await
        .map_err(api_error)?;
    Ok(Json(message))
}
