use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{
    exchanges, routing, EventBus, EventEnvelope, EventHandler, HandlerError, OrderBroadcastNotice,
};
use crate::models::broadcast::Broadcast;
use crate::models::order::{Order, OrderStatus};
use crate::store::{AcceptMark, BroadcastStore, OrderStore, StoreError};

#[derive(Debug, Error)]
#[error("candidate lookup failed: {0}")]
pub struct LookupError(pub String);

/// Which providers should be offered an order. Nearest-provider search lives
/// behind this seam.
#[async_trait]
pub trait CandidateLookup: Send + Sync {
    async fn candidates(&self, order: &Order) -> Result<Vec<Uuid>, LookupError>;
}

/// Offers every order to a fixed set of providers.
#[derive(Debug, Clone, Default)]
pub struct StaticRoster {
    providers: Vec<Uuid>,
}

impl StaticRoster {
    pub fn new(providers: Vec<Uuid>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl CandidateLookup for StaticRoster {
    async fn candidates(&self, _order: &Order) -> Result<Vec<Uuid>, LookupError> {
        Ok(self.providers.clone())
    }
}

/// Consumes `order.created`: records one broadcast row per candidate and
/// publishes a single `order.broadcast` notice for the fan-out.
pub struct BroadcastMatcher {
    orders: Arc<dyn OrderStore>,
    broadcasts: Arc<dyn BroadcastStore>,
    lookup: Arc<dyn CandidateLookup>,
    bus: EventBus,
}

impl BroadcastMatcher {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        broadcasts: Arc<dyn BroadcastStore>,
        lookup: Arc<dyn CandidateLookup>,
        bus: EventBus,
    ) -> Self {
        Self {
            orders,
            broadcasts,
            lookup,
            bus,
        }
    }
}

#[async_trait]
impl EventHandler for BroadcastMatcher {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let created: Order = envelope
            .decode()
            .map_err(|err| HandlerError::Reject(format!("malformed order payload: {err}")))?;

        let order = self
            .orders
            .get(created.id)
            .await
            .map_err(retry)?
            .ok_or_else(|| HandlerError::Reject(format!("order {} does not exist", created.id)))?;

        if order.status != OrderStatus::Pending {
            debug!(order_id = %order.id, status = %order.status, "order left PENDING before matching");
            return Ok(());
        }

        let candidates = self
            .lookup
            .candidates(&order)
            .await
            .map_err(|err| HandlerError::Retry(err.to_string()))?;
        if candidates.is_empty() {
            warn!(order_id = %order.id, "no candidate providers for order");
            return Ok(());
        }

        let mut recorded = 0;
        for provider_id in &candidates {
            if self
                .broadcasts
                .insert_if_absent(Broadcast::new(order.id, *provider_id))
                .await
                .map_err(retry)?
            {
                recorded += 1;
            }
        }

        let notice = OrderBroadcastNotice {
            order,
            provider_ids: candidates,
        };
        self.bus
            .publish(exchanges::ORDER, routing::ORDER_BROADCAST, None, &notice)
            .map_err(|err| HandlerError::Retry(err.to_string()))?;

        info!(
            order_id = %notice.order.id,
            candidates = notice.provider_ids.len(),
            recorded,
            "order broadcast to providers"
        );
        Ok(())
    }
}

/// Consumes `order.accepted` and flags the winner's broadcast row. Repeats
/// the write done inline by the accept path, so a crash between the order
/// write and the flag write heals on redelivery.
pub struct AcceptanceRecorder {
    broadcasts: Arc<dyn BroadcastStore>,
}

impl AcceptanceRecorder {
    pub fn new(broadcasts: Arc<dyn BroadcastStore>) -> Self {
        Self { broadcasts }
    }
}

#[async_trait]
impl EventHandler for AcceptanceRecorder {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let order: Order = envelope
            .decode()
            .map_err(|err| HandlerError::Reject(format!("malformed order payload: {err}")))?;
        let provider_id = order
            .provider_id
            .ok_or_else(|| HandlerError::Reject(format!("accepted order {} has no provider", order.id)))?;

        match self.broadcasts.mark_accepted(order.id, provider_id).await {
            Ok(AcceptMark::Marked) => {
                info!(order_id = %order.id, %provider_id, "broadcast flag repaired");
                Ok(())
            }
            Ok(AcceptMark::AlreadyMarked | AcceptMark::Missing) => Ok(()),
            Err(StoreError::Conflict(reason)) => Err(HandlerError::Reject(reason)),
            Err(err) => Err(retry(err)),
        }
    }
}

fn retry(err: StoreError) -> HandlerError {
    HandlerError::Retry(err.to_string())
}
