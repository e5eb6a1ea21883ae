use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use uuid::Uuid;

use crate::events::BusError;

#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: Uuid,
    pub routing_key: String,
    pub body: Arc<[u8]>,
    /// 1 on first delivery, incremented on every requeue.
    pub attempt: u32,
}

/// Broker operations the bus is built on. [`TopicBroker`] is the in-process
/// implementation; a networked broker client plugs in behind the same calls.
pub trait Transport: Send + Sync {
    fn declare_exchange(&self, name: &str) -> Result<(), BusError>;

    fn declare_queue(&self, name: &str) -> Result<(), BusError>;

    fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BusError>;

    /// Hands out the queue's single receiving end.
    fn take_receiver(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BusError>;

    /// Routes a message to every bound queue and returns how many took it.
    /// Either every matching queue gets a copy or none does.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message_id: Uuid,
        body: Vec<u8>,
    ) -> Result<usize, BusError>;

    /// Messages waiting in `queue`.
    fn queue_depth(&self, queue: &str) -> usize;

    /// Rejects further publishes. Consumers drain what is already buffered
    /// and then stop.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

struct Binding {
    exchange: String,
    pattern: String,
}

struct Queue {
    sender: mpsc::Sender<Delivery>,
    receiver: Mutex<Option<mpsc::Receiver<Delivery>>>,
    bindings: Vec<Binding>,
}

/// In-process topic broker with bounded durable queues.
///
/// Messages published while a queue has no consumer wait in the queue until
/// one attaches. A message reaches each matching queue at most once even when
/// several of its bindings match.
pub struct TopicBroker {
    exchanges: DashSet<String>,
    queues: DashMap<String, Queue>,
    queue_capacity: usize,
    closed: AtomicBool,
}

impl TopicBroker {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            exchanges: DashSet::new(),
            queues: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Transport for TopicBroker {
    fn declare_exchange(&self, name: &str) -> Result<(), BusError> {
        self.ensure_open()?;
        self.exchanges.insert(name.to_string());
        Ok(())
    }

    fn declare_queue(&self, name: &str) -> Result<(), BusError> {
        self.ensure_open()?;
        self.queues.entry(name.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::channel(self.queue_capacity);
            Queue {
                sender,
                receiver: Mutex::new(Some(receiver)),
                bindings: Vec::new(),
            }
        });
        Ok(())
    }

    fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BusError> {
        self.ensure_open()?;
        if !self.exchanges.contains(exchange) {
            return Err(BusError::UnknownExchange(exchange.to_string()));
        }

        let mut entry = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;

        let already_bound = entry
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.pattern == pattern);
        if !already_bound {
            entry.bindings.push(Binding {
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    fn take_receiver(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BusError> {
        let entry = self
            .queues
            .get(queue)
            .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;

        let mut slot = entry
            .receiver
            .lock()
            .map_err(|_| BusError::AlreadyConsumed(queue.to_string()))?;
        slot.take()
            .ok_or_else(|| BusError::AlreadyConsumed(queue.to_string()))
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message_id: Uuid,
        body: Vec<u8>,
    ) -> Result<usize, BusError> {
        self.ensure_open()?;
        if !self.exchanges.contains(exchange) {
            return Err(BusError::UnknownExchange(exchange.to_string()));
        }

        let targets: Vec<(String, mpsc::Sender<Delivery>)> = self
            .queues
            .iter()
            .filter(|entry| {
                entry
                    .bindings
                    .iter()
                    .any(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            })
            .map(|entry| (entry.key().clone(), entry.sender.clone()))
            .collect();

        if targets.is_empty() {
            debug!(exchange, routing_key, "message unroutable; no queue bound");
            return Ok(0);
        }

        // reserve a slot in every queue before sending to any of them
        let mut permits = Vec::with_capacity(targets.len());
        for (queue, sender) in targets {
            match sender.try_reserve_owned() {
                Ok(permit) => permits.push(permit),
                Err(TrySendError::Full(_)) => return Err(BusError::QueueFull(queue)),
                Err(TrySendError::Closed(_)) => return Err(BusError::QueueClosed(queue)),
            }
        }

        let body: Arc<[u8]> = body.into();
        let routed = permits.len();
        for permit in permits {
            permit.send(Delivery {
                message_id,
                routing_key: routing_key.to_string(),
                body: body.clone(),
                attempt: 1,
            });
        }
        Ok(routed)
    }

    fn queue_depth(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map(|entry| entry.sender.max_capacity() - entry.sender.capacity())
            .unwrap_or(0)
    }

    /// Also drops every queue, so consumers see their channel close once
    /// drained.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.queues.clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern, key) {
        ([], []) => true,
        (["#", rest @ ..], _) => {
            words_match(rest, key) || (!key.is_empty() && words_match(pattern, &key[1..]))
        }
        (["*", rest @ ..], [_, key_rest @ ..]) => words_match(rest, key_rest),
        ([word, rest @ ..], [head, key_rest @ ..]) => word == head && words_match(rest, key_rest),
        _ => false,
    }
}
