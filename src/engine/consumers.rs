use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::engine::matcher::{AcceptanceRecorder, BroadcastMatcher};
use crate::engine::tracker::TrackingStopper;
use crate::events::{
    exchanges, routing, BusError, EventEnvelope, EventHandler, HandlerError, Subscription,
};
use crate::state::AppState;

pub mod queues {
    pub const ORDER_BROADCAST: &str = "order.broadcast.queue";
    pub const ORDER_ACCEPTED: &str = "order.accepted.queue";
    pub const TRACKING_LIFECYCLE: &str = "location.lifecycle.queue";
    pub const AUDIT: &str = "audit.queue";
}

/// Bounded ring of the most recent order events.
pub struct AuditTrail {
    capacity: usize,
    entries: Mutex<VecDeque<EventEnvelope>>,
}

impl AuditTrail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<EventEnvelope> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().rev().take(limit).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventHandler for AuditTrail {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| HandlerError::Reject("audit trail lock poisoned".to_string()))?;

        // redeliveries carry the same id
        if entries.iter().any(|seen| seen.id == envelope.id) {
            return Ok(());
        }
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(envelope.clone());

        debug!(event_id = %envelope.id, event_type = %envelope.event_type, "event audited");
        Ok(())
    }
}

/// Binds every durable queue and starts its consumer.
pub fn spawn_consumers(state: &AppState) -> Result<Vec<Subscription>, BusError> {
    let bus = &state.bus;

    let matcher = BroadcastMatcher::new(
        state.store.clone(),
        state.store.clone(),
        state.lookup.clone(),
        bus.clone(),
    );
    let recorder = AcceptanceRecorder::new(state.store.clone());
    let stopper = TrackingStopper::new(state.store.clone());

    Ok(vec![
        bus.subscribe(
            queues::ORDER_BROADCAST,
            exchanges::ORDER,
            routing::ORDER_CREATED,
            Arc::new(matcher),
        )?,
        bus.subscribe(
            queues::ORDER_ACCEPTED,
            exchanges::ORDER,
            routing::ORDER_ACCEPTED,
            Arc::new(recorder),
        )?,
        bus.subscribe(
            queues::TRACKING_LIFECYCLE,
            exchanges::ORDER,
            "order.#",
            Arc::new(stopper),
        )?,
        bus.subscribe(queues::AUDIT, exchanges::ORDER, "#", state.audit.clone())?,
    ])
}
