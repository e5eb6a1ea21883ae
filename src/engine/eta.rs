use crate::geo::haversine_km;
use crate::models::order::GeoPoint;

/// Reported speeds at or below this are treated as standing still.
const MIN_MOVING_SPEED_KMH: f64 = 1.0;

pub trait EtaStrategy: Send + Sync {
    /// Minutes until `from` reaches `to`.
    fn eta_minutes(&self, from: &GeoPoint, to: &GeoPoint, speed_kmh: f64) -> u32;
}

/// Straight-line distance at the reported speed, or at the fallback speed
/// when the device reports none.
#[derive(Debug, Clone, Copy)]
pub struct SpeedBasedEta {
    fallback_speed_kmh: f64,
}

impl SpeedBasedEta {
    pub fn new(fallback_speed_kmh: f64) -> Self {
        Self { fallback_speed_kmh }
    }
}

impl EtaStrategy for SpeedBasedEta {
    fn eta_minutes(&self, from: &GeoPoint, to: &GeoPoint, speed_kmh: f64) -> u32 {
        let distance_km = haversine_km(from, to);
        minutes_at(distance_km, effective_speed(speed_kmh, self.fallback_speed_kmh))
    }
}

fn effective_speed(reported_kmh: f64, fallback_kmh: f64) -> f64 {
    if reported_kmh.is_finite() && reported_kmh > MIN_MOVING_SPEED_KMH {
        reported_kmh
    } else {
        fallback_kmh
    }
}

fn minutes_at(distance_km: f64, speed_kmh: f64) -> u32 {
    if distance_km <= 0.0 || speed_kmh <= 0.0 {
        return 0;
    }

    (distance_km / speed_kmh * 60.0).ceil().min(u32::MAX as f64) as u32
}
