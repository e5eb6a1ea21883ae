use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Accepted,
    OnTheWay,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Accepted => "ACCEPTED",
            OrderStatus::OnTheWay => "ON_THE_WAY",
            OrderStatus::Arrived => "ARRIVED",
            OrderStatus::InProgress => "IN_PROGRESS",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// Accepted through in-progress: a provider is attached and working.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Accepted
                | OrderStatus::OnTheWay
                | OrderStatus::Arrived
                | OrderStatus::InProgress
        )
    }

    /// The single state a forward transition into `self` must start from.
    /// `Pending` has none and `Cancelled` is reachable from any non-terminal state.
    pub fn predecessor(&self) -> Option<OrderStatus> {
        match self {
            OrderStatus::Pending | OrderStatus::Cancelled => None,
            OrderStatus::Accepted => Some(OrderStatus::Pending),
            OrderStatus::OnTheWay => Some(OrderStatus::Accepted),
            OrderStatus::Arrived => Some(OrderStatus::OnTheWay),
            OrderStatus::InProgress => Some(OrderStatus::Arrived),
            OrderStatus::Completed => Some(OrderStatus::InProgress),
        }
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == OrderStatus::Cancelled {
            return true;
        }
        next.predecessor() == Some(*self)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub client_id: Uuid,
    pub provider_id: Option<Uuid>,
    pub status: OrderStatus,
    pub description: String,
    pub service_location: GeoPoint,
    pub service_address: String,
    pub requested_time: DateTime<Utc>,
    pub broadcast_time: Option<DateTime<Utc>>,
    pub accepted_time: Option<DateTime<Utc>>,
    pub arrived_time: Option<DateTime<Utc>>,
    pub started_time: Option<DateTime<Utc>>,
    pub completed_time: Option<DateTime<Utc>>,
    pub cancelled_time: Option<DateTime<Utc>>,
    pub duration_minutes: i64,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.client_id == user_id || self.provider_id == Some(user_id)
    }

    /// Latest lifecycle timestamp recorded so far.
    pub fn last_stamp(&self) -> DateTime<Utc> {
        [
            self.broadcast_time,
            self.accepted_time,
            self.arrived_time,
            self.started_time,
            self.completed_time,
            self.cancelled_time,
        ]
        .into_iter()
        .flatten()
        .fold(self.created_at, DateTime::max)
    }
}
