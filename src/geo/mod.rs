use crate::models::order::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Great-circle distance between two points.
pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().min(1.0).asin();

    EARTH_RADIUS_KM * central_angle
}

#[cfg(test)]
mod tests {
    use super::haversine_km;
    use crate::models::order::GeoPoint;

    #[test]
    fn same_point_is_zero() {
        let p = GeoPoint {
            lat: -6.2088,
            lng: 106.8456,
        };
        assert!(haversine_km(&p, &p) < 1e-9);
    }

    #[test]
    fn jakarta_to_bandung_is_around_117_km() {
        let jakarta = GeoPoint {
            lat: -6.2088,
            lng: 106.8456,
        };
        let bandung = GeoPoint {
            lat: -6.9175,
            lng: 107.6191,
        };
        let distance = haversine_km(&jakarta, &bandung);
        assert!((distance - 116.0).abs() < 5.0, "got {distance}");
    }

    #[test]
    fn distance_is_symmetric() {
        let a = GeoPoint { lat: 1.0, lng: 2.0 };
        let b = GeoPoint { lat: 3.0, lng: -4.0 };
        assert!((haversine_km(&a, &b) - haversine_km(&b, &a)).abs() < 1e-9);
    }
}
