pub mod chats;
pub mod locations;
pub mod orders;
pub mod ws;

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::events::EventEnvelope;
use crate::state::AppState;

const DEFAULT_RECENT_EVENTS: usize = 50;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(orders::router())
        .merge(locations::router())
        .merge(chats::router())
        .merge(ws::router())
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/events/recent", get(recent_events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    orders: usize,
    tracked_orders: usize,
    audited_events: usize,
    event_bus: &'static str,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let bus_closed = state.bus.is_closed();

    Json(HealthResponse {
        status: if bus_closed { "degraded" } else { "ok" },
        orders: state.store.order_count(),
        tracked_orders: state.store.tracking_count(),
        audited_events: state.audit.len(),
        event_bus: if bus_closed { "closed" } else { "open" },
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}

#[derive(Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn recent_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Json<Vec<EventEnvelope>> {
    Json(state.audit.recent(query.limit.unwrap_or(DEFAULT_RECENT_EVENTS)))
}
