use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::eta::EtaStrategy;
use crate::error::AppError;
use crate::events::{exchanges, routing, EventBus, EventEnvelope, EventHandler, HandlerError};
use crate::geo::haversine_km;
use crate::models::order::Order;
use crate::models::tracking::{LocationHistory, PositionReport, Tracking, TrackingStatus};
use crate::observability::metrics::Metrics;
use crate::realtime::{frames, Frame, HubHandle};
use crate::store::{OrderStore, StoreError, TrackingStore, Upsert};

pub struct LocationTracker {
    orders: Arc<dyn OrderStore>,
    tracking: Arc<dyn TrackingStore>,
    eta: Arc<dyn EtaStrategy>,
    bus: EventBus,
    hub: HubHandle,
    metrics: Metrics,
}

impl LocationTracker {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        tracking: Arc<dyn TrackingStore>,
        eta: Arc<dyn EtaStrategy>,
        bus: EventBus,
        hub: HubHandle,
        metrics: Metrics,
    ) -> Self {
        Self {
            orders,
            tracking,
            eta,
            bus,
            hub,
            metrics,
        }
    }

    /// Ingests one GPS report. Every accepted report lands in the history;
    /// only reports that move the current row forward are fanned out.
    pub async fn report_position(&self, report: PositionReport) -> Result<Tracking, AppError> {
        let started = Instant::now();
        let result = self.ingest(report).await;

        let outcome = match &result {
            Ok((_, outcome)) => *outcome,
            Err(AppError::InvalidState(_) | AppError::Unauthorized(_)) => "rejected",
            Err(_) => "error",
        };
        self.metrics
            .location_reports_total
            .with_label_values(&[outcome])
            .inc();
        self.metrics
            .operation_latency_seconds
            .with_label_values(&["report_position", if result.is_ok() { "success" } else { "error" }])
            .observe(started.elapsed().as_secs_f64());

        result.map(|(tracking, _)| tracking)
    }

    async fn ingest(&self, report: PositionReport) -> Result<(Tracking, &'static str), AppError> {
        validate(&report)?;
        let order = self.require_order(report.order_id).await?;
        if order.provider_id != Some(report.provider_id) {
            return Err(AppError::Unauthorized(
                "only the assigned provider can report this order's position".to_string(),
            ));
        }
        if !order.status.is_active() {
            return Err(AppError::InvalidState(format!(
                "order {} is {}, not in progress",
                order.id, order.status
            )));
        }

        let position = report.position();
        let now = Utc::now();
        let next = Tracking {
            order_id: order.id,
            provider_id: report.provider_id,
            current: position,
            distance_km: haversine_km(&position, &order.service_location),
            eta_minutes: self
                .eta
                .eta_minutes(&position, &order.service_location, report.speed_kmh),
            status: TrackingStatus::Active,
            last_updated: now,
            reported_at: report.reported_at,
            created_at: now,
        };
        let entry = LocationHistory {
            id: Uuid::new_v4(),
            order_id: order.id,
            provider_id: report.provider_id,
            position,
            speed_kmh: report.speed_kmh,
            accuracy_meters: report.accuracy_meters,
            heading_degrees: report.heading_degrees,
            reported_at: report.reported_at,
            recorded_at: now,
        };

        let (tracking, outcome) = match self.tracking.record_report(next, entry).await? {
            Upsert::Stopped(_) => {
                return Err(AppError::InvalidState(format!(
                    "tracking for order {} is stopped",
                    order.id
                )));
            }
            Upsert::Created(tracking) => (tracking, "created"),
            Upsert::Updated(tracking) => (tracking, "updated"),
            Upsert::Stale(tracking) => (tracking, "stale"),
        };

        if outcome == "stale" {
            debug!(order_id = %order.id, "out-of-order report kept in history only");
            return Ok((tracking, outcome));
        }

        debug!(
            order_id = %order.id,
            provider_id = %tracking.provider_id,
            distance_km = tracking.distance_km,
            eta_minutes = tracking.eta_minutes,
            "position updated"
        );
        self.propagate(&tracking, Some(report.provider_id)).await;
        Ok((tracking, outcome))
    }

    pub async fn location(&self, order_id: Uuid) -> Result<Tracking, AppError> {
        self.tracking
            .get(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no tracking for order {order_id}")))
    }

    /// Rows in ingestion order.
    pub async fn history(&self, order_id: Uuid) -> Result<Vec<LocationHistory>, AppError> {
        Ok(self.tracking.history(order_id).await?)
    }

    pub async fn set_status(
        &self,
        order_id: Uuid,
        status: TrackingStatus,
    ) -> Result<Tracking, AppError> {
        let tracking = self.tracking.set_status(order_id, status).await?;
        info!(%order_id, status = ?status, "tracking status changed");
        self.propagate(&tracking, None).await;
        Ok(tracking)
    }

    async fn require_order(&self, order_id: Uuid) -> Result<Order, AppError> {
        self.orders
            .get(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
    }

    async fn propagate(&self, tracking: &Tracking, user_id: Option<Uuid>) {
        match Frame::new(frames::LOCATION_UPDATE, tracking) {
            Ok(frame) => {
                if let Err(err) = self.hub.broadcast(tracking.order_id, &frame).await {
                    warn!(order_id = %tracking.order_id, error = %err, "failed to broadcast location frame");
                }
            }
            Err(err) => {
                warn!(order_id = %tracking.order_id, error = %err, "failed to build location frame")
            }
        }

        self.bus.publish_best_effort(
            exchanges::LOCATION,
            routing::LOCATION_UPDATED,
            user_id,
            tracking,
        );
    }
}

fn validate(report: &PositionReport) -> Result<(), AppError> {
    if !report.position().is_valid() {
        return Err(AppError::BadRequest(
            "latitude/longitude out of range".to_string(),
        ));
    }
    if !report.speed_kmh.is_finite() || report.speed_kmh < 0.0 {
        return Err(AppError::BadRequest("speed must be >= 0".to_string()));
    }
    if report.heading_degrees >= 360 {
        return Err(AppError::BadRequest(
            "heading must be within 0..360".to_string(),
        ));
    }
    Ok(())
}

/// Stops tracking once an order reaches a terminal state.
pub struct TrackingStopper {
    tracking: Arc<dyn TrackingStore>,
}

impl TrackingStopper {
    pub fn new(tracking: Arc<dyn TrackingStore>) -> Self {
        Self { tracking }
    }
}

#[async_trait]
impl EventHandler for TrackingStopper {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        // order.broadcast carries a notice, not an order
        if envelope.event_type != routing::ORDER_STATUS_UPDATED
            && envelope.event_type != routing::ORDER_CANCELLED
        {
            return Ok(());
        }

        let order: Order = envelope
            .decode()
            .map_err(|err| HandlerError::Reject(format!("malformed order payload: {err}")))?;
        if !order.status.is_terminal() {
            return Ok(());
        }

        match self
            .tracking
            .set_status(order.id, TrackingStatus::Stopped)
            .await
        {
            Ok(_) => {
                info!(order_id = %order.id, status = %order.status, "tracking stopped");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(HandlerError::Retry(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::{LocationTracker, TrackingStopper};
    use crate::engine::eta::SpeedBasedEta;
    use crate::error::AppError;
    use crate::events::bus::DeliverySettings;
    use crate::events::{routing, EventBus, EventEnvelope, EventHandler};
    use crate::models::order::{GeoPoint, Order, OrderStatus};
    use crate::models::tracking::{PositionReport, TrackingStatus};
    use crate::observability::metrics::Metrics;
    use crate::realtime::{Hub, HubHandle, HubKind};
    use crate::store::memory::MemoryStore;
    use crate::store::{OrderStore, TrackingStore};

    const DESTINATION: GeoPoint = GeoPoint {
        lat: -6.2088,
        lng: 106.8456,
    };

    fn order() -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            order_number: "ORD-20250101-000001".to_string(),
            client_id: Uuid::new_v4(),
            provider_id: Some(Uuid::new_v4()),
            status: OrderStatus::OnTheWay,
            description: "aircon service".to_string(),
            service_location: DESTINATION,
            service_address: "Jakarta".to_string(),
            requested_time: now,
            broadcast_time: Some(now),
            accepted_time: Some(now),
            arrived_time: None,
            started_time: None,
            completed_time: None,
            cancelled_time: None,
            duration_minutes: 0,
            cancellation_reason: None,
            cancelled_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn report(order: &Order, lat: f64) -> PositionReport {
        PositionReport {
            order_id: order.id,
            provider_id: order.provider_id.unwrap(),
            latitude: lat,
            longitude: DESTINATION.lng,
            speed_kmh: 0.0,
            accuracy_meters: 5,
            heading_degrees: 180,
            reported_at: None,
        }
    }

    async fn setup() -> (LocationTracker, Arc<MemoryStore>, HubHandle, Order) {
        let metrics = Metrics::new();
        let store = Arc::new(MemoryStore::new());
        let order = order();
        store.insert(order.clone()).await.unwrap();

        let (hub, handle) = Hub::new(HubKind::Locations, 32, 16, metrics.clone());
        tokio::spawn(hub.run());

        let tracker = LocationTracker::new(
            store.clone(),
            store.clone(),
            Arc::new(SpeedBasedEta::new(30.0)),
            EventBus::new(32, DeliverySettings::default(), metrics.clone()),
            handle.clone(),
            metrics,
        );
        (tracker, store, handle, order)
    }

    #[tokio::test]
    async fn reports_accumulate_and_current_follows_the_latest() {
        let (tracker, _store, _hub, order) = setup().await;

        let first = tracker.report_position(report(&order, -6.1188)).await.unwrap();
        assert_eq!(first.status, TrackingStatus::Active);
        assert!(first.distance_km > 9.0 && first.distance_km < 11.0);
        assert!(first.eta_minutes > 0);

        tracker.report_position(report(&order, -6.1588)).await.unwrap();
        let last = tracker.report_position(report(&order, -6.2000)).await.unwrap();

        let current = tracker.location(order.id).await.unwrap();
        assert_eq!(current.current, last.current);
        assert!(current.distance_km < first.distance_km);
        assert_eq!(current.created_at, first.created_at);

        let history = tracker.history(order.id).await.unwrap();
        let lats: Vec<f64> = history.iter().map(|row| row.position.lat).collect();
        assert_eq!(lats, vec![-6.1188, -6.1588, -6.2000]);
    }

    #[tokio::test]
    async fn subscribers_of_the_order_get_location_frames() {
        let (tracker, _store, hub, order) = setup().await;
        let mut watcher = hub.register(order.id).await.unwrap();

        tracker.report_position(report(&order, -6.15)).await.unwrap();

        let raw = watcher.recv().await.unwrap();
        let frame: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(frame["type"], "location_update");
        assert_eq!(frame["data"]["order_id"], order.id.to_string());
    }

    #[tokio::test]
    async fn older_device_report_only_lands_in_history() {
        let (tracker, _store, _hub, order) = setup().await;
        let now = Utc::now();

        let mut fresh = report(&order, -6.15);
        fresh.reported_at = Some(now);
        tracker.report_position(fresh).await.unwrap();

        let mut late = report(&order, -6.10);
        late.reported_at = Some(now - Duration::seconds(30));
        let kept = tracker.report_position(late).await.unwrap();

        assert_eq!(kept.current.lat, -6.15);
        assert_eq!(tracker.history(order.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stopped_tracking_rejects_and_paused_resumes() {
        let (tracker, _store, _hub, order) = setup().await;
        tracker.report_position(report(&order, -6.15)).await.unwrap();

        tracker
            .set_status(order.id, TrackingStatus::Paused)
            .await
            .unwrap();
        let resumed = tracker.report_position(report(&order, -6.16)).await.unwrap();
        assert_eq!(resumed.status, TrackingStatus::Active);

        tracker
            .set_status(order.id, TrackingStatus::Stopped)
            .await
            .unwrap();
        let rejected = tracker.report_position(report(&order, -6.17)).await;
        assert!(matches!(rejected, Err(AppError::InvalidState(_))));
        assert_eq!(tracker.history(order.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_order_and_bad_coordinates_fail() {
        let (tracker, _store, _hub, order) = setup().await;

        let mut stranger = report(&order, -6.15);
        stranger.order_id = Uuid::new_v4();
        assert!(matches!(
            tracker.report_position(stranger).await,
            Err(AppError::NotFound(_))
        ));

        assert!(matches!(
            tracker.report_position(report(&order, 95.0)).await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            tracker.location(order.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn only_the_assigned_provider_may_report() {
        let (tracker, store, _hub, order) = setup().await;

        let mut stranger = report(&order, 10.0);
        stranger.provider_id = Uuid::new_v4();
        assert!(matches!(
            tracker.report_position(stranger).await,
            Err(AppError::Unauthorized(_))
        ));
        assert_eq!(store.tracking_count(), 0);
        assert!(tracker.history(order.id).await.unwrap().is_empty());

        tracker.report_position(report(&order, -6.15)).await.unwrap();
        let mut stranger = report(&order, 10.0);
        stranger.provider_id = Uuid::new_v4();
        assert!(tracker.report_position(stranger).await.is_err());
        assert_eq!(tracker.location(order.id).await.unwrap().current.lat, -6.15);
    }

    #[tokio::test]
    async fn orders_outside_the_provider_path_reject_reports() {
        let (tracker, store, _hub, order) = setup().await;

        let mut finished = order.clone();
        finished.id = Uuid::new_v4();
        finished.status = OrderStatus::Completed;
        store.insert(finished.clone()).await.unwrap();

        let mut pending = order.clone();
        pending.id = Uuid::new_v4();
        pending.status = OrderStatus::Pending;
        store.insert(pending.clone()).await.unwrap();

        for target in [&finished, &pending] {
            assert!(matches!(
                tracker.report_position(report(target, -6.15)).await,
                Err(AppError::InvalidState(_))
            ));
        }
        assert_eq!(store.tracking_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reports_leave_current_equal_to_last_history_row() {
        let (tracker, _store, _hub, order) = setup().await;
        let tracker = Arc::new(tracker);

        for round in 0..40 {
            let mut handles = Vec::new();
            for n in 0..8 {
                let tracker = tracker.clone();
                let report = report(&order, -6.0 - (round * 8 + n) as f64 * 0.001);
                handles.push(tokio::spawn(async move {
                    tracker.report_position(report).await
                }));
            }
            for handle in handles {
                handle.await.unwrap().unwrap();
            }

            let current = tracker.location(order.id).await.unwrap();
            let history = tracker.history(order.id).await.unwrap();
            assert_eq!(history.len(), (round + 1) * 8);
            assert_eq!(current.current, history.last().unwrap().position);
        }
    }

    #[tokio::test]
    async fn terminal_order_event_stops_tracking() {
        let (tracker, store, _hub, mut order) = setup().await;
        tracker.report_position(report(&order, -6.15)).await.unwrap();

        let stopper = TrackingStopper::new(store.clone());
        order.status = OrderStatus::Completed;
        let envelope = EventEnvelope::new(routing::ORDER_STATUS_UPDATED, None, &order).unwrap();
        stopper.handle(&envelope).await.unwrap();
        stopper.handle(&envelope).await.unwrap();

        let tracking = TrackingStore::get(store.as_ref(), order.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tracking.status, TrackingStatus::Stopped);

        let other = EventEnvelope::new(routing::ORDER_CANCELLED, None, &{
            let mut o = order.clone();
            o.id = Uuid::new_v4();
            o.status = OrderStatus::Cancelled;
            o
        })
        .unwrap();
        stopper.handle(&other).await.unwrap();
    }
}
