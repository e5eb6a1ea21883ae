use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::realtime::{frames, Frame, HubHandle};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws/orders/:id", get(order_updates))
        .route("/ws/locations/:id", get(location_updates))
        .route("/ws/chat/:id", get(chat_updates))
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Orders,
    Locations,
    Chat,
}

#[derive(Deserialize)]
pub struct ChatQuery {
    pub user_id: Uuid,
}

async fn order_updates(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    state.orders.get(order_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, Channel::Orders, order_id)))
}

async fn location_updates(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    state.orders.get(order_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, Channel::Locations, order_id)))
}

async fn chat_updates(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Query(query): Query<ChatQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let order = state.orders.get(order_id).await?;
    if !order.is_participant(query.user_id) {
        return Err(AppError::Unauthorized(
            "only the order's client or provider can join this chat".to_string(),
        ));
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, Channel::Chat, order_id)))
}

fn hub_for(state: &AppState, channel: Channel) -> &HubHandle {
    match channel {
        Channel::Orders => &state.hubs.orders,
        Channel::Locations => &state.hubs.locations,
        Channel::Chat => &state.hubs.chat,
    }
}

/// Current authoritative state, read after registering so nothing published
/// in between is missed.
async fn snapshot(state: &AppState, channel: Channel, order_id: Uuid) -> Option<Frame> {
    let built = match channel {
        Channel::Orders => match state.orders.get(order_id).await {
            Ok(order) => Frame::new(frames::ORDER_SNAPSHOT, &order),
            Err(_) => return None,
        },
        Channel::Locations => match state.tracker.location(order_id).await {
            Ok(tracking) => Frame::new(frames::LOCATION_SNAPSHOT, &tracking),
            Err(_) => return None,
        },
        Channel::Chat => return None,
    };

    match built {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!(%order_id, error = %err, "failed to build snapshot frame");
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, channel: Channel, order_id: Uuid) {
    let hub = hub_for(&state, channel).clone();
    let subscriber = match hub.register(order_id).await {
        Ok(subscriber) => subscriber,
        Err(err) => {
            warn!(%order_id, error = %err, "websocket rejected: hub unavailable");
            return;
        }
    };
    let connection_id = subscriber.id();
    let (registration, outbound) = subscriber.split();
    let (mut sender, mut receiver) = socket.split();

    info!(hub = hub.kind().as_str(), %order_id, %connection_id, "websocket client connected");

    if let Some(frame) = snapshot(&state, channel, order_id).await {
        let sent = match frame.encode() {
            Ok(payload) => sender.send(Message::Text(payload.to_string())).await.is_ok(),
            Err(err) => {
                warn!(%order_id, error = %err, "failed to encode snapshot frame");
                true
            }
        };
        if !sent {
            registration.release().await;
            return;
        }
    }

    let mut send_task = tokio::spawn(async move {
        let mut queued = ReceiverStream::new(outbound);
        while let Some(payload) = queued.next().await {
            if sender.send(Message::Text(payload.to_string())).await.is_err() {
                break;
            }
        }
        // queue closed by the hub: evicted or shut down
        let _ = sender.close().await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    registration.release().await;
    info!(hub = hub.kind().as_str(), %order_id, %connection_id, "websocket client disconnected");
}
