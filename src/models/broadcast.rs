use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    pub id: Uuid,
    pub order_id: Uuid,
    pub provider_id: Uuid,
    pub notified_at: DateTime<Utc>,
    pub seen_at: Option<DateTime<Utc>>,
    pub accepted: bool,
}

impl Broadcast {
    pub fn new(order_id: Uuid, provider_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            provider_id,
            notified_at: Utc::now(),
            seen_at: None,
            accepted: false,
        }
    }
}
