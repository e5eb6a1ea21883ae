use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub order_transitions_total: IntCounterVec,
    pub accept_attempts_total: IntCounterVec,
    pub operation_latency_seconds: HistogramVec,
    pub hub_connections: IntGaugeVec,
    pub hub_evictions_total: IntCounterVec,
    pub events_published_total: IntCounterVec,
    pub events_consumed_total: IntCounterVec,
    pub location_reports_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let order_transitions_total = IntCounterVec::new(
            Opts::new("order_transitions_total", "Order state transitions by target status"),
            &["status"],
        )
        .expect("valid order_transitions_total metric");

        let accept_attempts_total = IntCounterVec::new(
            Opts::new("accept_attempts_total", "Accept attempts by outcome"),
            &["outcome"],
        )
        .expect("valid accept_attempts_total metric");

        let operation_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "operation_latency_seconds",
                "Latency of order and location operations in seconds",
            ),
            &["operation", "outcome"],
        )
        .expect("valid operation_latency_seconds metric");

        let hub_connections = IntGaugeVec::new(
            Opts::new("hub_connections", "Live connections registered per hub"),
            &["hub"],
        )
        .expect("valid hub_connections metric");

        let hub_evictions_total = IntCounterVec::new(
            Opts::new("hub_evictions_total", "Slow connections dropped by a hub"),
            &["hub"],
        )
        .expect("valid hub_evictions_total metric");

        let events_published_total = IntCounterVec::new(
            Opts::new("events_published_total", "Events published by routing key and outcome"),
            &["routing_key", "outcome"],
        )
        .expect("valid events_published_total metric");

        let events_consumed_total = IntCounterVec::new(
            Opts::new("events_consumed_total", "Event deliveries by queue and outcome"),
            &["queue", "outcome"],
        )
        .expect("valid events_consumed_total metric");

        let location_reports_total = IntCounterVec::new(
            Opts::new("location_reports_total", "Position reports by outcome"),
            &["outcome"],
        )
        .expect("valid location_reports_total metric");

        registry
            .register(Box::new(order_transitions_total.clone()))
            .expect("register order_transitions_total");
        registry
            .register(Box::new(accept_attempts_total.clone()))
            .expect("register accept_attempts_total");
        registry
            .register(Box::new(operation_latency_seconds.clone()))
            .expect("register operation_latency_seconds");
        registry
            .register(Box::new(hub_connections.clone()))
            .expect("register hub_connections");
        registry
            .register(Box::new(hub_evictions_total.clone()))
            .expect("register hub_evictions_total");
        registry
            .register(Box::new(events_published_total.clone()))
            .expect("register events_published_total");
        registry
            .register(Box::new(events_consumed_total.clone()))
            .expect("register events_consumed_total");
        registry
            .register(Box::new(location_reports_total.clone()))
            .expect("register location_reports_total");

        Self {
            registry,
            order_transitions_total,
            accept_attempts_total,
            operation_latency_seconds,
            hub_connections,
            hub_evictions_total,
            events_published_total,
            events_consumed_total,
            location_reports_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
