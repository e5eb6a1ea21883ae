use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::order::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackingStatus {
    Active,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tracking {
    pub order_id: Uuid,
    pub provider_id: Uuid,
    pub current: GeoPoint,
    pub distance_km: f64,
    pub eta_minutes: u32,
    pub status: TrackingStatus,
    pub last_updated: DateTime<Utc>,
    /// Device-side timestamp of the report currently applied, when the device sent one.
    pub reported_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationHistory {
    pub id: Uuid,
    pub order_id: Uuid,
    pub provider_id: Uuid,
    pub position: GeoPoint,
    pub speed_kmh: f64,
    pub accuracy_meters: u32,
    pub heading_degrees: u16,
    pub reported_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionReport {
    pub order_id: Uuid,
    pub provider_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed_kmh: f64,
    #[serde(default)]
    pub accuracy_meters: u32,
    #[serde(default)]
    pub heading_degrees: u16,
    #[serde(default)]
    pub reported_at: Option<DateTime<Utc>>,
}

impl PositionReport {
    pub fn position(&self) -> GeoPoint {
        GeoPoint {
            lat: self.latitude,
            lng: self.longitude,
        }
    }
}
