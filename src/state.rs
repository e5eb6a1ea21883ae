use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::engine::chat::ChatService;
use crate::engine::consumers::AuditTrail;
use crate::engine::eta::SpeedBasedEta;
use crate::engine::matcher::{CandidateLookup, StaticRoster};
use crate::engine::orders::OrderService;
use crate::engine::tracker::LocationTracker;
use crate::events::bus::DeliverySettings;
use crate::events::EventBus;
use crate::observability::metrics::Metrics;
use crate::realtime::Hubs;
use crate::store::memory::MemoryStore;

pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub orders: OrderService,
    pub tracker: LocationTracker,
    pub chat: ChatService,
    pub bus: EventBus,
    pub hubs: Hubs,
    pub audit: Arc<AuditTrail>,
    pub lookup: Arc<dyn CandidateLookup>,
    pub metrics: Metrics,
}

impl AppState {
    /// Wires the in-memory stores, the bus and the hubs. Spawns the hub
    /// actors, so it must run inside a tokio runtime.
    pub fn new(config: &Config) -> Self {
        let metrics = Metrics::new();
        let store = Arc::new(MemoryStore::new());

        let bus = EventBus::new(
            config.event_queue_capacity,
            DeliverySettings {
                max_redeliveries: config.event_max_redeliveries,
                redelivery_delay: Duration::from_millis(config.event_redelivery_delay_ms),
            },
            metrics.clone(),
        );
        let hubs = Hubs::spawn(
            config.hub_command_buffer,
            config.hub_connection_buffer,
            &metrics,
        );

        let orders = OrderService::new(
            store.clone(),
            store.clone(),
            bus.clone(),
            hubs.orders.clone(),
            metrics.clone(),
        );
        let tracker = LocationTracker::new(
            store.clone(),
            store.clone(),
            Arc::new(SpeedBasedEta::new(config.fallback_speed_kmh)),
            bus.clone(),
            hubs.locations.clone(),
            metrics.clone(),
        );
        let chat = ChatService::new(store.clone(), store.clone(), bus.clone(), hubs.chat.clone());

        Self {
            store,
            orders,
            tracker,
            chat,
            bus,
            hubs,
            audit: Arc::new(AuditTrail::new(config.audit_capacity)),
            lookup: Arc::new(StaticRoster::new(config.candidate_provider_ids.clone())),
            metrics,
        }
    }
}
