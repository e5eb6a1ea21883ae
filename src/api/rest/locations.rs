use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::tracking::{LocationHistory, PositionReport, Tracking, TrackingStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/locations/track", post(track))
        .route("/locations/order/:id", get(current_location))
        .route("/locations/order/:id/history", get(location_history))
        .route("/locations/order/:id/status", patch(set_tracking_status))
}

#[derive(Deserialize)]
pub struct TrackingStatusRequest {
    pub status: TrackingStatus,
}

async fn track(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PositionReport>,
) -> Result<Json<Tracking>, AppError> {
    Ok(Json(state.tracker.report_position(payload).await?))
}

async fn current_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Tracking>, AppError> {
    Ok(Json(state.tracker.location(id).await?))
}

async fn location_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<LocationHistory>>, AppError> {
    Ok(Json(state.tracker.history(id).await?))
}

async fn set_tracking_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TrackingStatusRequest>,
) -> Result<Json<Tracking>, AppError> {
    Ok(Json(state.tracker.set_status(id, payload.status).await?))
}
