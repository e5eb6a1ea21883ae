use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::events::{exchanges, routing, EventBus};
use crate::models::broadcast::Broadcast;
use crate::models::order::{GeoPoint, Order, OrderStatus};
use crate::observability::metrics::Metrics;
use crate::realtime::{frames, Frame, HubHandle};
use crate::store::{AcceptMark, BroadcastStore, OrderFilter, OrderStore, Swap};

const NO_LONGER_AVAILABLE: &str = "order is no longer available for acceptance";

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub client_id: Uuid,
    pub description: String,
    pub service_latitude: f64,
    pub service_longitude: f64,
    #[serde(default)]
    pub service_address: String,
    #[serde(default)]
    pub requested_time: Option<DateTime<Utc>>,
}

/// Owns the order lifecycle. Every transition is a single conditional write
/// on the order's status; propagation to the hub and the bus follows the
/// write and never undoes it.
pub struct OrderService {
    orders: Arc<dyn OrderStore>,
    broadcasts: Arc<dyn BroadcastStore>,
    bus: EventBus,
    hub: HubHandle,
    metrics: Metrics,
}

impl OrderService {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        broadcasts: Arc<dyn BroadcastStore>,
        bus: EventBus,
        hub: HubHandle,
        metrics: Metrics,
    ) -> Self {
        Self {
            orders,
            broadcasts,
            bus,
            hub,
            metrics,
        }
    }

    pub async fn create(&self, request: NewOrder) -> Result<Order, AppError> {
        let started = Instant::now();
        let result = self.create_order(request).await;
        self.observe("create", started, result.is_ok());
        result
    }

    async fn create_order(&self, request: NewOrder) -> Result<Order, AppError> {
        if request.description.trim().is_empty() {
            return Err(AppError::BadRequest("description cannot be empty".to_string()));
        }

        let service_location = GeoPoint {
            lat: request.service_latitude,
            lng: request.service_longitude,
        };
        if !service_location.is_valid() {
            return Err(AppError::BadRequest(
                "service location is out of range".to_string(),
            ));
        }

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            order_number: order_number(now),
            client_id: request.client_id,
            provider_id: None,
            status: OrderStatus::Pending,
            description: request.description,
            service_location,
            service_address: request.service_address,
            requested_time: request.requested_time.unwrap_or(now),
            broadcast_time: Some(now),
            accepted_time: None,
            arrived_time: None,
            started_time: None,
            completed_time: None,
            cancelled_time: None,
            duration_minutes: 0,
            cancellation_reason: None,
            cancelled_by: None,
            created_at: now,
            updated_at: now,
        };

        self.orders.insert(order.clone()).await?;
        self.count_transition(OrderStatus::Pending);

        self.bus.publish_best_effort(
            exchanges::ORDER,
            routing::ORDER_CREATED,
            Some(order.client_id),
            &order,
        );

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            client_id = %order.client_id,
            "order created"
        );
        Ok(order)
    }

    /// Resolves the accept race: of all concurrent callers exactly one moves
    /// the order out of PENDING, every other caller gets a conflict.
    pub async fn accept(&self, order_id: Uuid, provider_id: Uuid) -> Result<Order, AppError> {
        let started = Instant::now();
        let result = self.accept_order(order_id, provider_id).await;

        let outcome = match &result {
            Ok(_) => "won",
            Err(AppError::Conflict(_)) => "lost",
            Err(_) => "error",
        };
        self.metrics
            .accept_attempts_total
            .with_label_values(&[outcome])
            .inc();
        self.observe("accept", started, result.is_ok());
        result
    }

    async fn accept_order(&self, order_id: Uuid, provider_id: Uuid) -> Result<Order, AppError> {
        let current = self.require(order_id).await?;
        if current.status != OrderStatus::Pending {
            return Err(AppError::Conflict(NO_LONGER_AVAILABLE.to_string()));
        }

        let now = next_stamp(&current);
        let mut next = current;
        next.provider_id = Some(provider_id);
        next.status = OrderStatus::Accepted;
        next.accepted_time = Some(now);
        next.updated_at = now;

        let order = match self.orders.compare_and_swap(OrderStatus::Pending, next).await? {
            Swap::Applied(order) => order,
            Swap::Stale(latest) => {
                debug!(order_id = %order_id, %provider_id, status = %latest.status, "accept lost the race");
                return Err(AppError::Conflict(NO_LONGER_AVAILABLE.to_string()));
            }
        };
        self.count_transition(OrderStatus::Accepted);

        match self.broadcasts.mark_accepted(order_id, provider_id).await {
            Ok(AcceptMark::Missing) => {
                debug!(order_id = %order_id, %provider_id, "accepted by a provider without a broadcast row");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(order_id = %order_id, %provider_id, error = %err, "failed to flag broadcast accepted");
            }
        }

        info!(order_id = %order.id, %provider_id, "order accepted");
        self.propagate(&order, routing::ORDER_ACCEPTED, frames::ORDER_UPDATE, Some(provider_id))
            .await;
        Ok(order)
    }

    /// Moves an accepted order one step along the provider's path.
    pub async fn advance(
        &self,
        order_id: Uuid,
        provider_id: Uuid,
        target: OrderStatus,
    ) -> Result<Order, AppError> {
        let started = Instant::now();
        let result = self.advance_order(order_id, provider_id, target).await;
        self.observe("advance", started, result.is_ok());
        result
    }

    async fn advance_order(
        &self,
        order_id: Uuid,
        provider_id: Uuid,
        target: OrderStatus,
    ) -> Result<Order, AppError> {
        let expected = match target {
            OrderStatus::OnTheWay
            | OrderStatus::Arrived
            | OrderStatus::InProgress
            | OrderStatus::Completed => target.predecessor(),
            _ => None,
        }
        .ok_or_else(|| AppError::BadRequest(format!("{target} is not a provider step")))?;

        let current = self.require(order_id).await?;
        if current.provider_id != Some(provider_id) {
            return Err(AppError::Unauthorized(
                "only the assigned provider can update this order".to_string(),
            ));
        }
        if !current.status.can_transition_to(target) {
            return Err(invalid_step(current.status, target));
        }

        let now = next_stamp(&current);
        let mut next = current;
        next.status = target;
        next.updated_at = now;
        match target {
            OrderStatus::Arrived => next.arrived_time = Some(now),
            OrderStatus::InProgress => next.started_time = Some(now),
            OrderStatus::Completed => {
                next.completed_time = Some(now);
                next.duration_minutes = next
                    .started_time
                    .map(|start| (now - start).num_minutes().max(0))
                    .unwrap_or(0);
            }
            _ => {}
        }

        let order = match self.orders.compare_and_swap(expected, next).await? {
            Swap::Applied(order) => order,
            Swap::Stale(latest) => return Err(invalid_step(latest.status, target)),
        };
        self.count_transition(target);

        info!(order_id = %order.id, %provider_id, status = %order.status, "order status updated");
        self.propagate(
            &order,
            routing::ORDER_STATUS_UPDATED,
            frames::ORDER_UPDATE,
            Some(provider_id),
        )
        .await;
        Ok(order)
    }

    pub async fn cancel(
        &self,
        order_id: Uuid,
        actor_id: Uuid,
        reason: Option<String>,
    ) -> Result<Order, AppError> {
        let started = Instant::now();
        let result = self.cancel_order(order_id, actor_id, reason).await;
        self.observe("cancel", started, result.is_ok());
        result
    }

    async fn cancel_order(
        &self,
        order_id: Uuid,
        actor_id: Uuid,
        reason: Option<String>,
    ) -> Result<Order, AppError> {
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        let mut current = self.require(order_id).await?;

        // status only moves forward, so this settles within a few rounds
        let order = loop {
            if !current.is_participant(actor_id) {
                return Err(AppError::Unauthorized(
                    "only the client or the assigned provider can cancel this order".to_string(),
                ));
            }
            if !current.status.can_transition_to(OrderStatus::Cancelled) {
                return Err(AppError::InvalidState(format!(
                    "order is already {}",
                    current.status
                )));
            }

            let expected = current.status;
            let now = next_stamp(&current);
            let mut next = current;
            next.status = OrderStatus::Cancelled;
            next.cancelled_time = Some(now);
            next.cancellation_reason = reason.clone();
            next.cancelled_by = Some(actor_id);
            next.updated_at = now;

            match self.orders.compare_and_swap(expected, next).await? {
                Swap::Applied(order) => break order,
                Swap::Stale(latest) => current = latest,
            }
        };
        self.count_transition(OrderStatus::Cancelled);

        info!(order_id = %order.id, %actor_id, "order cancelled");
        self.propagate(
            &order,
            routing::ORDER_CANCELLED,
            frames::ORDER_CANCELLED,
            Some(actor_id),
        )
        .await;
        Ok(order)
    }

    pub async fn get(&self, order_id: Uuid) -> Result<Order, AppError> {
        self.require(order_id).await
    }

    pub async fn pending(&self) -> Result<Vec<Order>, AppError> {
        Ok(self.orders.list(OrderFilter::Pending).await?)
    }

    pub async fn active(&self) -> Result<Vec<Order>, AppError> {
        Ok(self.orders.list(OrderFilter::Active).await?)
    }

    pub async fn for_client(&self, client_id: Uuid) -> Result<Vec<Order>, AppError> {
        Ok(self.orders.list(OrderFilter::Client(client_id)).await?)
    }

    pub async fn for_provider(&self, provider_id: Uuid) -> Result<Vec<Order>, AppError> {
        Ok(self.orders.list(OrderFilter::Provider(provider_id)).await?)
    }

    pub async fn broadcasts(&self, order_id: Uuid) -> Result<Vec<Broadcast>, AppError> {
        self.require(order_id).await?;
        Ok(self.broadcasts.list_for_order(order_id).await?)
    }

    pub async fn mark_seen(&self, order_id: Uuid, provider_id: Uuid) -> Result<Broadcast, AppError> {
        Ok(self
            .broadcasts
            .mark_seen(order_id, provider_id, Utc::now())
            .await?)
    }

    async fn require(&self, order_id: Uuid) -> Result<Order, AppError> {
        self.orders
            .get(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
    }

    async fn propagate(
        &self,
        order: &Order,
        routing_key: &str,
        frame_type: &str,
        user_id: Option<Uuid>,
    ) {
        match Frame::new(frame_type, order) {
            Ok(frame) => {
                if let Err(err) = self.hub.broadcast(order.id, &frame).await {
                    warn!(order_id = %order.id, error = %err, "failed to broadcast order frame");
                }
            }
            Err(err) => warn!(order_id = %order.id, error = %err, "failed to build order frame"),
        }

        self.bus
            .publish_best_effort(exchanges::ORDER, routing_key, user_id, order);
    }

    fn count_transition(&self, status: OrderStatus) {
        self.metrics
            .order_transitions_total
            .with_label_values(&[status.as_str()])
            .inc();
    }

    fn observe(&self, operation: &str, started: Instant, ok: bool) {
        let outcome = if ok { "success" } else { "error" };
        self.metrics
            .operation_latency_seconds
            .with_label_values(&[operation, outcome])
            .observe(started.elapsed().as_secs_f64());
    }
}

/// Lifecycle stamps never go backwards, even if the wall clock does.
fn next_stamp(order: &Order) -> DateTime<Utc> {
    Utc::now().max(order.last_stamp())
}

fn invalid_step(current: OrderStatus, target: OrderStatus) -> AppError {
    AppError::InvalidState(format!("cannot move order from {current} to {target}"))
}

/// `ORD-YYYYMMDD-XXXXXX`
fn order_number(at: DateTime<Utc>) -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(6)
        .collect();
    format!("ORD-{}-{}", at.format("%Y%m%d"), suffix.to_ascii_uppercase())
}
