use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::events::{exchanges, routing, EventBus};
use crate::models::chat::{ChatMessage, SenderRole};
use crate::models::order::Order;
use crate::realtime::{frames, Frame, HubHandle};
use crate::store::{ChatStore, OrderStore};

pub const MAX_MESSAGE_CHARS: usize = 2000;

#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    pub order_id: Uuid,
    pub sender_id: Uuid,
    #[serde(alias = "message")]
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadReceipt {
    pub order_id: Uuid,
    pub reader_id: Uuid,
    pub marked: usize,
    pub read_at: DateTime<Utc>,
}

/// Per-order conversation between the client and the assigned provider.
pub struct ChatService {
    orders: Arc<dyn OrderStore>,
    chats: Arc<dyn ChatStore>,
    bus: EventBus,
    hub: HubHandle,
}

impl ChatService {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        chats: Arc<dyn ChatStore>,
        bus: EventBus,
        hub: HubHandle,
    ) -> Self {
        Self {
            orders,
            chats,
            bus,
            hub,
        }
    }

    pub async fn send(&self, request: NewMessage) -> Result<ChatMessage, AppError> {
        let body = request.body.trim();
        if body.is_empty() {
            return Err(AppError::BadRequest("message cannot be empty".to_string()));
        }
        if body.chars().count() > MAX_MESSAGE_CHARS {
            return Err(AppError::BadRequest(format!(
                "message exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }

        let order = self.require_order(request.order_id).await?;
        let sender_role = role_of(&order, request.sender_id).ok_or_else(|| {
            AppError::Unauthorized("only the order's client or provider can chat".to_string())
        })?;

        let message = ChatMessage {
            id: Uuid::new_v4(),
            order_id: order.id,
            sender_id: request.sender_id,
            sender_role,
            body: body.to_string(),
            is_read: false,
            created_at: Utc::now(),
            read_at: None,
        };
        self.chats.append(message.clone()).await?;

        info!(order_id = %order.id, sender_id = %message.sender_id, "chat message sent");
        self.push(order.id, frames::NEW_MESSAGE, &message).await;
        self.bus.publish_best_effort(
            exchanges::CHAT,
            routing::CHAT_MESSAGE_SENT,
            Some(message.sender_id),
            &message,
        );
        Ok(message)
    }

    /// Oldest first.
    pub async fn history(&self, order_id: Uuid) -> Result<Vec<ChatMessage>, AppError> {
        self.require_order(order_id).await?;
        Ok(self.chats.history(order_id).await?)
    }

    pub async fn unread_count(&self, order_id: Uuid, user_id: Uuid) -> Result<usize, AppError> {
        Ok(self.chats.unread_count(order_id, user_id).await?)
    }

    pub async fn mark_read(&self, order_id: Uuid, user_id: Uuid) -> Result<ReadReceipt, AppError> {
        let order = self.require_order(order_id).await?;
        if role_of(&order, user_id).is_none() {
            return Err(AppError::Unauthorized(
                "only the order's client or provider can read this chat".to_string(),
            ));
        }

        let read_at = Utc::now();
        let marked = self.chats.mark_read(order_id, user_id, read_at).await?;
        let receipt = ReadReceipt {
            order_id,
            reader_id: user_id,
            marked,
            read_at,
        };

        if marked > 0 {
            self.push(order_id, frames::MESSAGES_READ, &receipt).await;
        }
        Ok(receipt)
    }

    async fn require_order(&self, order_id: Uuid) -> Result<Order, AppError> {
        self.orders
            .get(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
    }

    async fn push<T: Serialize>(&self, order_id: Uuid, frame_type: &str, data: &T) {
        let sent = match Frame::new(frame_type, data) {
            Ok(frame) => self.hub.broadcast(order_id, &frame).await,
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            warn!(%order_id, frame_type, error = %err, "failed to push chat frame");
        }
    }
}

fn role_of(order: &Order, user_id: Uuid) -> Option<SenderRole> {
    if order.client_id == user_id {
        Some(SenderRole::Client)
    } else if order.provider_id == Some(user_id) {
        Some(SenderRole::Provider)
    } else {
        None
    }
}
