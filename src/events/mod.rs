//! Asynchronous event propagation.
//!
//! Producers publish immutable [`EventEnvelope`]s to topic exchanges; every
//! durable queue bound to a matching routing key gets its own copy and is
//! drained by exactly one consumer task. Delivery is at-least-once, so
//! handlers must tolerate duplicates.

pub mod broker;
pub mod bus;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::order::Order;

pub use bus::{EventBus, EventHandler, HandlerError, Subscription};

pub mod exchanges {
    pub const ORDER: &str = "order.events";
    pub const LOCATION: &str = "location.events";
    pub const CHAT: &str = "chat.events";
    pub const PAYMENT: &str = "payment.events";

    pub const ALL: [&str; 4] = [ORDER, LOCATION, CHAT, PAYMENT];
}

pub mod routing {
    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_BROADCAST: &str = "order.broadcast";
    pub const ORDER_ACCEPTED: &str = "order.accepted";
    pub const ORDER_STATUS_UPDATED: &str = "order.status.updated";
    pub const ORDER_CANCELLED: &str = "order.cancelled";
    pub const LOCATION_UPDATED: &str = "location.updated";
    pub const CHAT_MESSAGE_SENT: &str = "chat.message.sent";
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,

    #[error("unknown exchange {0}")]
    UnknownExchange(String),

    #[error("unknown queue {0}")]
    UnknownQueue(String),

    #[error("queue {0} already has a consumer")]
    AlreadyConsumed(String),

    #[error("queue {0} is full")]
    QueueFull(String),

    #[error("queue {0} lost its consumer")]
    QueueClosed(String),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new<T: Serialize>(
        event_type: &str,
        user_id: Option<Uuid>,
        payload: &T,
    ) -> Result<Self, BusError> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            user_id,
            data: serde_json::to_value(payload)?,
            timestamp: Utc::now(),
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// Fan-out notice for the providers offered a freshly created order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBroadcastNotice {
    pub order: Order,
    pub provider_ids: Vec<Uuid>,
}
