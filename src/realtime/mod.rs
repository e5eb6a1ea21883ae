pub mod hub;

pub use hub::{Frame, Hub, HubError, HubHandle, HubKind, Registration, Subscriber};

/// Frame types pushed to live connections.
pub mod frames {
    pub const ORDER_UPDATE: &str = "order_update";
    pub const ORDER_CANCELLED: &str = "order_cancelled";
    pub const ORDER_SNAPSHOT: &str = "order_snapshot";
    pub const LOCATION_UPDATE: &str = "location_update";
    pub const LOCATION_SNAPSHOT: &str = "location_snapshot";
    pub const NEW_MESSAGE: &str = "new_message";
    pub const MESSAGES_READ: &str = "messages_read";
}

/// One hub per live-update domain.
#[derive(Clone)]
pub struct Hubs {
    pub orders: HubHandle,
    pub locations: HubHandle,
    pub chat: HubHandle,
}

impl Hubs {
    /// Spawns the three hub actors on the current runtime.
    pub fn spawn(
        command_buffer: usize,
        connection_buffer: usize,
        metrics: &crate::observability::metrics::Metrics,
    ) -> Self {
        let start = |kind| {
            let (hub, handle) = Hub::new(kind, command_buffer, connection_buffer, metrics.clone());
            tokio::spawn(hub.run());
            handle
        };

        Self {
            orders: start(HubKind::Orders),
            locations: start(HubKind::Locations),
            chat: start(HubKind::Chat),
        }
    }
}
