use std::convert::Infallible;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, Stream};

use crate::api::current_user;
use crate::error::api_error;
use crate::models::ChatTurnRequest;
use crate::relay::frame::DONE_MARKER;
use crate::relay::RelayEvent;
use crate::state::AppState;

/// POST /api/chat - RAG chat turn streamed as SSE.
///
/// Events, in order: `data: {"delta": ...}` frames, at most one
/// `event: error`, an optional `event: warning` when the reply could not be
/// saved, `data: [DONE]`, then `event: message` with the stored message.
/// Validation failures (unknown model, foreign chat, empty message) are
/// plain HTTP errors and no stream is opened.
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatTurnRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let user = current_user(&state).await?;
    let handle = state.relay.start(&user, req).await.map_err(api_error)?;

    // Dropping this stream (client gone) drops the receiver, which the
    // relay observes as a disconnect.
    let events = stream::unfold(handle.events, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Ok(to_sse(event)), rx))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn to_sse(event: RelayEvent) -> Event {
    match event {
        RelayEvent::Delta(delta) => {
            Event::default().data(serde_json::json!({ "delta": delta }).to_string())
        }
        RelayEvent::Error(message) => Event::default()
            .event("error")
            .data(serde_json::json!({ "error": message }).to_string()),
        RelayEvent::Warning(message) => Event::default()
            .event("warning")
            .data(serde_json::json!({ "warning": message }).to_string()),
        RelayEvent::Done => Event::default().data(DONE_MARKER),
        RelayEvent::Message(message) => Event::default()
            .event("message")
            .data(serde_json::to_value(&message).unwrap_or_default().to_string()),
    }
}
