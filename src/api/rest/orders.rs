use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::orders::NewOrder;
use crate::error::AppError;
use crate::models::broadcast::Broadcast;
use crate::models::order::{Order, OrderStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/pending", get(pending_orders))
        .route("/orders/active", get(active_orders))
        .route("/orders/client/:id", get(client_orders))
        .route("/orders/provider/:id", get(provider_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/accept", patch(accept_order))
        .route("/orders/:id/on-the-way", patch(on_the_way))
        .route("/orders/:id/arrived", patch(arrived))
        .route("/orders/:id/start-job", patch(start_job))
        .route("/orders/:id/complete-job", patch(complete_job))
        .route("/orders/:id/cancel", patch(cancel_order))
        .route("/orders/:id/broadcasts", get(order_broadcasts))
        .route("/orders/:id/broadcasts/seen", patch(mark_broadcast_seen))
}

#[derive(Deserialize)]
pub struct ProviderRequest {
    pub provider_id: Uuid,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    #[serde(alias = "actor_id")]
    pub user_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewOrder>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    let order = state.orders.create(payload).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.get(id).await?))
}

async fn pending_orders(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Order>>, AppError> {
    Ok(Json(state.orders.pending().await?))
}

async fn active_orders(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Order>>, AppError> {
    Ok(Json(state.orders.active().await?))
}

async fn client_orders(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Order>>, AppError> {
    Ok(Json(state.orders.for_client(id).await?))
}

async fn provider_orders(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Order>>, AppError> {
    Ok(Json(state.orders.for_provider(id).await?))
}

async fn accept_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ProviderRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.accept(id, payload.provider_id).await?))
}

async fn on_the_way(
    state: State<Arc<AppState>>,
    id: Path<Uuid>,
    payload: Json<ProviderRequest>,
) -> Result<Json<Order>, AppError> {
    advance(state, id, payload, OrderStatus::OnTheWay).await
}

async fn arrived(
    state: State<Arc<AppState>>,
    id: Path<Uuid>,
    payload: Json<ProviderRequest>,
) -> Result<Json<Order>, AppError> {
    advance(state, id, payload, OrderStatus::Arrived).await
}

async fn start_job(
    state: State<Arc<AppState>>,
    id: Path<Uuid>,
    payload: Json<ProviderRequest>,
) -> Result<Json<Order>, AppError> {
    advance(state, id, payload, OrderStatus::InProgress).await
}

async fn complete_job(
    state: State<Arc<AppState>>,
    id: Path<Uuid>,
    payload: Json<ProviderRequest>,
) -> Result<Json<Order>, AppError> {
    advance(state, id, payload, OrderStatus::Completed).await
}

async fn advance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ProviderRequest>,
    target: OrderStatus,
) -> Result<Json<Order>, AppError> {
    Ok(Json(
        state.orders.advance(id, payload.provider_id, target).await?,
    ))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(
        state
            .orders
            .cancel(id, payload.user_id, payload.reason)
            .await?,
    ))
}

async fn order_broadcasts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Broadcast>>, AppError> {
    Ok(Json(state.orders.broadcasts(id).await?))
}

async fn mark_broadcast_seen(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ProviderRequest>,
) -> Result<Json<Broadcast>, AppError> {
    Ok(Json(state.orders.mark_seen(id, payload.provider_id).await?))
}
