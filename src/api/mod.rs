//! Axum handlers. Every handler resolves the current user first and
//! returns `(StatusCode, String)` on failure.

pub mod chat;
pub mod chats;
pub mod knowledge;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::error::{api_error, RagError};
use crate::state::AppState;
use crate::store::UserIdentity;

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "vectors": state.vectors.entry_count(),
    }))
}

pub(crate) async fn current_user(state: &AppState) -> Result<UserIdentity, (StatusCode, String)> {
    state.identity.current_user().await.map_err(api_error)
}

/// Reject access to a resource owned by someone else.
pub(crate) fn ensure_owner(
    user: &UserIdentity,
    owner_id: &str,
    what: impl std::fmt::Display,
) -> Result<(), (StatusCode, String)> {
    if user.id == owner_id {
        Ok(())
    } else {
        Err(api_error(RagError::Authorization(what.to_string())))
    }
}
