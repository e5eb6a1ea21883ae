use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::broker::{Delivery, TopicBroker, Transport};
use crate::events::{exchanges, BusError, EventEnvelope};
use crate::observability::metrics::Metrics;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transient failure; the message goes back on the queue.
    #[error("retry: {0}")]
    Retry(String),

    /// Permanent failure; the message is dead-lettered without retrying.
    #[error("rejected: {0}")]
    Reject(String),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy)]
pub struct DeliverySettings {
    pub max_redeliveries: u32,
    pub redelivery_delay: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_redeliveries: 5,
            redelivery_delay: Duration::from_millis(100),
        }
    }
}

/// Typed publish/subscribe client over a [`Transport`].
#[derive(Clone)]
pub struct EventBus {
    transport: Arc<dyn Transport>,
    settings: DeliverySettings,
    metrics: Metrics,
}

impl EventBus {
    /// Bus over a fresh in-process [`TopicBroker`].
    pub fn new(queue_capacity: usize, settings: DeliverySettings, metrics: Metrics) -> Self {
        let broker = TopicBroker::new(queue_capacity);
        for exchange in exchanges::ALL {
            // an open broker accepts every declaration
            let _ = broker.declare_exchange(exchange);
        }

        Self {
            transport: Arc::new(broker),
            settings,
            metrics,
        }
    }

    /// Bus over any transport. Declares the well-known exchanges.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        settings: DeliverySettings,
        metrics: Metrics,
    ) -> Result<Self, BusError> {
        for exchange in exchanges::ALL {
            transport.declare_exchange(exchange)?;
        }

        Ok(Self {
            transport,
            settings,
            metrics,
        })
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Wraps `payload` in an envelope tagged with `routing_key` and hands it
    /// to the broker. Once this returns `Ok`, every bound queue holds a copy.
    pub fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        user_id: Option<Uuid>,
        payload: &T,
    ) -> Result<EventEnvelope, BusError> {
        let result = EventEnvelope::new(routing_key, user_id, payload).and_then(|envelope| {
            let body = serde_json::to_vec(&envelope)?;
            let routed = self
                .transport
                .publish(exchange, routing_key, envelope.id, body)?;
            debug!(exchange, routing_key, event_id = %envelope.id, routed, "event published");
            Ok(envelope)
        });

        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.metrics
            .events_published_total
            .with_label_values(&[routing_key, outcome])
            .inc();

        result
    }

    /// Publishes after an authoritative write. Failures are logged, never
    /// returned: the persisted state stays the source of truth.
    pub fn publish_best_effort<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        user_id: Option<Uuid>,
        payload: &T,
    ) -> Option<EventEnvelope> {
        match self.publish(exchange, routing_key, user_id, payload) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                warn!(exchange, routing_key, error = %err, "failed to publish event");
                None
            }
        }
    }

    /// Declares `queue`, binds it and starts its single consumer task.
    pub fn subscribe(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, BusError> {
        self.transport.declare_queue(queue)?;
        self.transport.bind(queue, exchange, routing_key)?;
        let receiver = self.transport.take_receiver(queue)?;

        let consumer = Consumer {
            queue: queue.to_string(),
            handler,
            settings: self.settings,
            metrics: self.metrics.clone(),
        };
        let handle = tokio::spawn(consumer.run(receiver));

        info!(queue, exchange, routing_key, "event consumer started");
        Ok(Subscription {
            queue: queue.to_string(),
            handle,
        })
    }

    pub fn close(&self) {
        self.transport.close();
    }
}

pub struct Subscription {
    queue: String,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Waits for the consumer to drain its queue after the bus is closed.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            error!(queue = %self.queue, error = %err, "event consumer panicked");
        }
    }
}

struct Consumer {
    queue: String,
    handler: Arc<dyn EventHandler>,
    settings: DeliverySettings,
    metrics: Metrics,
}

impl Consumer {
    async fn run(self, mut receiver: mpsc::Receiver<Delivery>) {
        while let Some(delivery) = receiver.recv().await {
            let outcome = self.process(delivery).await;
            self.metrics
                .events_consumed_total
                .with_label_values(&[self.queue.as_str(), outcome])
                .inc();
        }

        warn!(queue = %self.queue, "event consumer stopped: queue closed");
    }

    /// Runs the handler until it acks, rejects, or runs out of redeliveries.
    /// Requeued messages are retried in place so the queue keeps its order.
    async fn process(&self, mut delivery: Delivery) -> &'static str {
        let envelope: EventEnvelope = match serde_json::from_slice(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(
                    queue = %self.queue,
                    message_id = %delivery.message_id,
                    routing_key = %delivery.routing_key,
                    error = %err,
                    "undecodable message dead-lettered"
                );
                return "dead_lettered";
            }
        };

        loop {
            match self.handler.handle(&envelope).await {
                Ok(()) => return "acked",
                Err(HandlerError::Reject(reason)) => {
                    error!(
                        queue = %self.queue,
                        event_id = %envelope.id,
                        event_type = %envelope.event_type,
                        reason = %reason,
                        "event rejected and dead-lettered"
                    );
                    return "dead_lettered";
                }
                Err(HandlerError::Retry(reason)) if delivery.attempt <= self.settings.max_redeliveries => {
                    warn!(
                        queue = %self.queue,
                        event_id = %envelope.id,
                        attempt = delivery.attempt,
                        reason = %reason,
                        "event handler failed; requeueing"
                    );
                    self.metrics
                        .events_consumed_total
                        .with_label_values(&[self.queue.as_str(), "requeued"])
                        .inc();
                    tokio::time::sleep(self.settings.redelivery_delay).await;
                    delivery.attempt += 1;
                }
                Err(HandlerError::Retry(reason)) => {
                    error!(
                        queue = %self.queue,
                        event_id = %envelope.id,
                        attempts = delivery.attempt,
                        reason = %reason,
                        "event redeliveries exhausted; dead-lettered"
                    );
                    return "dead_lettered";
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::{DeliverySettings, EventBus, EventHandler, HandlerError};
    use crate::events::broker::{Delivery, TopicBroker, Transport};
    use crate::events::{exchanges, routing, BusError, EventEnvelope};
    use crate::observability::metrics::Metrics;

    struct Recorder {
        seen: Mutex<Vec<EventEnvelope>>,
        failures_left: AtomicUsize,
    }

    impl Recorder {
        fn failing(times: usize) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                failures_left: AtomicUsize::new(times),
            })
        }

        fn seen(&self) -> Vec<EventEnvelope> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(envelope.clone());
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(HandlerError::Retry("simulated outage".to_string()));
            }
            Ok(())
        }
    }

    fn bus(max_redeliveries: u32) -> EventBus {
        EventBus::new(
            16,
            DeliverySettings {
                max_redeliveries,
                redelivery_delay: Duration::from_millis(1),
            },
            Metrics::new(),
        )
    }

    async fn wait_for(recorder: &Recorder, count: usize) {
        for _ in 0..200 {
            if recorder.seen().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn failed_handler_gets_the_same_event_again() {
        let bus = bus(5);
        let recorder = Recorder::failing(2);
        bus.subscribe("test.queue", exchanges::ORDER, routing::ORDER_CREATED, recorder.clone())
            .unwrap();

        let published = bus
            .publish(exchanges::ORDER, routing::ORDER_CREATED, None, &json!({"n": 1}))
            .unwrap();

        wait_for(&recorder, 3).await;
        let seen = recorder.seen();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|envelope| envelope.id == published.id));
        assert_eq!(seen[0].event_type, "order.created");
    }

    #[tokio::test]
    async fn two_queues_on_one_key_both_receive() {
        let bus = bus(0);
        let matcher = Recorder::failing(0);
        let audit = Recorder::failing(0);
        bus.subscribe("matcher.queue", exchanges::ORDER, routing::ORDER_CREATED, matcher.clone())
            .unwrap();
        bus.subscribe("audit.queue", exchanges::ORDER, "#", audit.clone())
            .unwrap();

        bus.publish(exchanges::ORDER, routing::ORDER_CREATED, None, &json!({}))
            .unwrap();
        bus.publish(exchanges::ORDER, routing::ORDER_ACCEPTED, None, &json!({}))
            .unwrap();

        wait_for(&audit, 2).await;
        wait_for(&matcher, 1).await;
        assert_eq!(audit.seen().len(), 2);
        assert_eq!(matcher.seen().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_redeliveries_move_on_to_next_message() {
        let bus = bus(1);
        let recorder = Recorder::failing(2);
        bus.subscribe("q", exchanges::CHAT, "#", recorder.clone()).unwrap();

        let first = bus
            .publish(exchanges::CHAT, routing::CHAT_MESSAGE_SENT, None, &json!({"n": 1}))
            .unwrap();
        let second = bus
            .publish(exchanges::CHAT, routing::CHAT_MESSAGE_SENT, None, &json!({"n": 2}))
            .unwrap();

        wait_for(&recorder, 3).await;
        let ids: Vec<_> = recorder.seen().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first.id, first.id, second.id]);
    }

    #[tokio::test]
    async fn subscribing_twice_to_one_queue_fails() {
        let bus = bus(0);
        bus.subscribe("q", exchanges::ORDER, "#", Recorder::failing(0))
            .unwrap();
        assert!(bus
            .subscribe("q", exchanges::ORDER, "#", Recorder::failing(0))
            .is_err());
    }

    #[tokio::test]
    async fn closed_bus_refuses_publish() {
        let bus = bus(0);
        bus.close();
        assert!(bus
            .publish(exchanges::ORDER, routing::ORDER_CREATED, None, &json!({}))
            .is_err());
        assert!(bus
            .publish_best_effort(exchanges::ORDER, routing::ORDER_CREATED, None, &json!({}))
            .is_none());
    }

    /// Counts publishes and hands everything else to an in-process broker.
    struct CountingTransport {
        inner: TopicBroker,
        published: AtomicUsize,
    }

    impl Transport for CountingTransport {
        fn declare_exchange(&self, name: &str) -> Result<(), BusError> {
            self.inner.declare_exchange(name)
        }

        fn declare_queue(&self, name: &str) -> Result<(), BusError> {
            self.inner.declare_queue(name)
        }

        fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BusError> {
            self.inner.bind(queue, exchange, pattern)
        }

        fn take_receiver(
            &self,
            queue: &str,
        ) -> Result<tokio::sync::mpsc::Receiver<Delivery>, BusError> {
            self.inner.take_receiver(queue)
        }

        fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            message_id: uuid::Uuid,
            body: Vec<u8>,
        ) -> Result<usize, BusError> {
            self.published.fetch_add(1, Ordering::SeqCst);
            self.inner.publish(exchange, routing_key, message_id, body)
        }

        fn queue_depth(&self, queue: &str) -> usize {
            self.inner.queue_depth(queue)
        }

        fn close(&self) {
            self.inner.close()
        }

        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
    }

    #[tokio::test]
    async fn bus_runs_over_a_supplied_transport() {
        let transport = Arc::new(CountingTransport {
            inner: TopicBroker::new(8),
            published: AtomicUsize::new(0),
        });
        let bus = EventBus::with_transport(
            transport.clone(),
            DeliverySettings::default(),
            Metrics::new(),
        )
        .unwrap();

        let recorder = Recorder::failing(0);
        bus.subscribe("q", exchanges::LOCATION, "location.*", recorder.clone())
            .unwrap();
        bus.publish(exchanges::LOCATION, routing::LOCATION_UPDATED, None, &json!({"lat": 1.0}))
            .unwrap();

        wait_for(&recorder, 1).await;
        assert_eq!(recorder.seen().len(), 1);
        assert_eq!(transport.published.load(Ordering::SeqCst), 1);

        bus.close();
        assert!(bus.is_closed());
        assert!(transport.inner.is_closed());
    }

    #[test]
    fn supplied_transport_that_is_closed_is_refused() {
        let broker = TopicBroker::new(4);
        broker.close();
        let bus = EventBus::with_transport(Arc::new(broker), DeliverySettings::default(), Metrics::new());
        assert!(matches!(bus, Err(BusError::Closed)));
    }
}
