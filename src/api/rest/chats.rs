use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::chat::{NewMessage, ReadReceipt};
use crate::error::AppError;
use crate::models::chat::ChatMessage;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chats/messages", post(send_message))
        .route("/chats/order/:id", get(chat_history))
        .route("/chats/order/:id/unread", get(unread_count))
        .route("/chats/order/:id/read", patch(mark_read))
}

#[derive(Deserialize)]
pub struct UserQuery {
    pub user_id: Uuid,
}

#[derive(Deserialize)]
pub struct ReadRequest {
    pub user_id: Uuid,
}

#[derive(Serialize)]
pub struct UnreadResponse {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub unread: usize,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewMessage>,
) -> Result<(StatusCode, Json<ChatMessage>), AppError> {
    let message = state.chat.send(payload).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn chat_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ChatMessage>>, AppError> {
    Ok(Json(state.chat.history(id).await?))
}

async fn unread_count(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<UserQuery>,
) -> Result<Json<UnreadResponse>, AppError> {
    let unread = state.chat.unread_count(id, query.user_id).await?;
    Ok(Json(UnreadResponse {
        order_id: id,
        user_id: query.user_id,
        unread,
    }))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReadRequest>,
) -> Result<Json<ReadReceipt>, AppError> {
    Ok(Json(state.chat.mark_read(id, payload.user_id).await?))
}
