use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::broadcast::Broadcast;
use crate::models::chat::ChatMessage;
use crate::models::order::{Order, OrderStatus};
use crate::models::tracking::{LocationHistory, Tracking, TrackingStatus};
use crate::store::{
    AcceptMark, BroadcastStore, ChatStore, OrderFilter, OrderStore, StoreError, Swap,
    TrackingStore, Upsert,
};

/// In-process store. Every conditional write runs while holding the
/// `DashMap` shard lock of the entry it touches.
#[derive(Default)]
pub struct MemoryStore {
    orders: DashMap<Uuid, Order>,
    broadcasts: DashMap<Uuid, Vec<Broadcast>>,
    tracking: DashMap<Uuid, Tracking>,
    history: DashMap<Uuid, Vec<LocationHistory>>,
    chats: DashMap<Uuid, Vec<ChatMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn tracking_count(&self) -> usize {
        self.tracking.len()
    }

    fn push_history(&self, entry: LocationHistory) {
        self.history.entry(entry.order_id).or_default().push(entry);
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert(&self, order: Order) -> Result<(), StoreError> {
        match self.orders.entry(order.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("order {}", order.id))),
            Entry::Vacant(slot) => {
                slot.insert(order);
                Ok(())
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.get(&id).map(|entry| entry.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        expected: OrderStatus,
        next: Order,
    ) -> Result<Swap, StoreError> {
        let mut current = self
            .orders
            .get_mut(&next.id)
            .ok_or_else(|| StoreError::NotFound(format!("order {}", next.id)))?;

        if current.status != expected {
            return Ok(Swap::Stale(current.clone()));
        }

        *current = next.clone();
        Ok(Swap::Applied(next))
    }

    async fn list(&self, filter: OrderFilter) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| {
                let order = entry.value();
                match filter {
                    OrderFilter::Pending => order.status == OrderStatus::Pending,
                    OrderFilter::Active => order.status.is_active(),
                    OrderFilter::Client(id) => order.client_id == id,
                    OrderFilter::Provider(id) => order.provider_id == Some(id),
                }
            })
            .map(|entry| entry.value().clone())
            .collect();

        match filter {
            OrderFilter::Pending => orders.sort_by_key(|order| order.created_at),
            _ => orders.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        }

        Ok(orders)
    }
}

#[async_trait]
impl BroadcastStore for MemoryStore {
    async fn insert_if_absent(&self, broadcast: Broadcast) -> Result<bool, StoreError> {
        let mut rows = self.broadcasts.entry(broadcast.order_id).or_default();
        if rows
            .iter()
            .any(|row| row.provider_id == broadcast.provider_id)
        {
            return Ok(false);
        }

        rows.push(broadcast);
        Ok(true)
    }

    async fn list_for_order(&self, order_id: Uuid) -> Result<Vec<Broadcast>, StoreError> {
        Ok(self
            .broadcasts
            .get(&order_id)
            .map(|rows| rows.value().clone())
            .unwrap_or_default())
    }

    async fn mark_accepted(
        &self,
        order_id: Uuid,
        provider_id: Uuid,
    ) -> Result<AcceptMark, StoreError> {
        let Some(mut rows) = self.broadcasts.get_mut(&order_id) else {
            return Ok(AcceptMark::Missing);
        };

        if let Some(other) = rows
            .iter()
            .find(|row| row.accepted && row.provider_id != provider_id)
        {
            return Err(StoreError::Conflict(format!(
                "order {order_id} already accepted by provider {}",
                other.provider_id
            )));
        }

        match rows.iter_mut().find(|row| row.provider_id == provider_id) {
            Some(row) if row.accepted => Ok(AcceptMark::AlreadyMarked),
            Some(row) => {
                row.accepted = true;
                Ok(AcceptMark::Marked)
            }
            None => Ok(AcceptMark::Missing),
        }
    }

    async fn mark_seen(
        &self,
        order_id: Uuid,
        provider_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Broadcast, StoreError> {
        let mut rows = self
            .broadcasts
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::NotFound(format!("broadcasts for order {order_id}")))?;

        let row = rows
            .iter_mut()
            .find(|row| row.provider_id == provider_id)
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "broadcast for order {order_id} and provider {provider_id}"
                ))
            })?;

        if row.seen_at.is_none() {
            row.seen_at = Some(at);
        }
        Ok(row.clone())
    }
}

#[async_trait]
impl TrackingStore for MemoryStore {
    async fn get(&self, order_id: Uuid) -> Result<Option<Tracking>, StoreError> {
        Ok(self.tracking.get(&order_id).map(|entry| entry.value().clone()))
    }

    async fn record_report(
        &self,
        mut next: Tracking,
        entry: LocationHistory,
    ) -> Result<Upsert, StoreError> {
        // the tracking entry stays locked until the history row is pushed
        match self.tracking.entry(next.order_id) {
            Entry::Vacant(slot) => {
                let _row = slot.insert(next.clone());
                self.push_history(entry);
                Ok(Upsert::Created(next))
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.status == TrackingStatus::Stopped {
                    return Ok(Upsert::Stopped(current.clone()));
                }
                if let (Some(stored), Some(incoming)) = (current.reported_at, next.reported_at) {
                    if incoming < stored {
                        let kept = current.clone();
                        self.push_history(entry);
                        return Ok(Upsert::Stale(kept));
                    }
                }
                if next.reported_at.is_none() {
                    next.reported_at = current.reported_at;
                }
                next.created_at = current.created_at;
                slot.insert(next.clone());
                self.push_history(entry);
                Ok(Upsert::Updated(next))
            }
        }
    }

    async fn set_status(
        &self,
        order_id: Uuid,
        status: TrackingStatus,
    ) -> Result<Tracking, StoreError> {
        let mut tracking = self
            .tracking
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::NotFound(format!("tracking for order {order_id}")))?;

        tracking.status = status;
        tracking.last_updated = Utc::now();
        Ok(tracking.clone())
    }

    async fn history(&self, order_id: Uuid) -> Result<Vec<LocationHistory>, StoreError> {
        Ok(self
            .history
            .get(&order_id)
            .map(|rows| rows.value().clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn append(&self, message: ChatMessage) -> Result<(), StoreError> {
        self.chats.entry(message.order_id).or_default().push(message);
        Ok(())
    }

    async fn history(&self, order_id: Uuid) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .chats
            .get(&order_id)
            .map(|rows| rows.value().clone())
            .unwrap_or_default())
    }

    async fn unread_count(&self, order_id: Uuid, user_id: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .chats
            .get(&order_id)
            .map(|rows| {
                rows.iter()
                    .filter(|msg| !msg.is_read && msg.sender_id != user_id)
                    .count()
            })
            .unwrap_or(0))
    }

    async fn mark_read(
        &self,
        order_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let Some(mut rows) = self.chats.get_mut(&order_id) else {
            return Ok(0);
        };

        let mut marked = 0;
        for msg in rows
            .iter_mut()
            .filter(|msg| !msg.is_read && msg.sender_id != user_id)
        {
            msg.is_read = true;
            msg.read_at = Some(at);
            marked += 1;
        }
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::MemoryStore;
    use crate::models::broadcast::Broadcast;
    use crate::models::order::{GeoPoint, Order, OrderStatus};
    use crate::models::tracking::{LocationHistory, Tracking, TrackingStatus};
    use crate::store::{AcceptMark, BroadcastStore, OrderStore, Swap, TrackingStore, Upsert};

    fn pending_order() -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            order_number: "ORD-TEST".to_string(),
            client_id: Uuid::new_v4(),
            provider_id: None,
            status: OrderStatus::Pending,
            description: "fix sink".to_string(),
            service_location: GeoPoint { lat: 1.0, lng: 1.0 },
            service_address: "1 Main St".to_string(),
            requested_time: now,
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
        }
    }

    fn tracking(order_id: Uuid, lat: f64, reported_at: Option<chrono::DateTime<Utc>>) -> Tracking {
        let now = Utc::now();
        Tracking {
            order_id,
            provider_id: Uuid::from_u128(7),
            current: GeoPoint { lat, lng: 0.0 },
            distance_km: 0.0,
            eta_minutes: 0,
            status: TrackingStatus::Active,
            last_updated: now,
            reported_at,
            created_at: now,
        }
    }

    fn report(order_id: Uuid, lat: f64, reported_at: Option<chrono::DateTime<Utc>>) -> (Tracking, LocationHistory) {
        let next = tracking(order_id, lat, reported_at);
        let entry = LocationHistory {
            id: Uuid::new_v4(),
            order_id,
            provider_id: next.provider_id,
            position: next.current,
            speed_kmh: 0.0,
            accuracy_meters: 5,
            heading_degrees: 0,
            reported_at,
            recorded_at: next.last_updated,
        };
        (next, entry)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn only_one_swap_from_pending_wins() {
        let store = Arc::new(MemoryStore::new());
        let order = pending_order();
        store.insert(order.clone()).await.unwrap();

        let mut handles = Vec::new();
        for seed in 0..32u128 {
            let store = store.clone();
            let mut next = order.clone();
            handles.push(tokio::spawn(async move {
                next.status = OrderStatus::Accepted;
                next.provider_id = Some(Uuid::from_u128(seed + 1));
                store.compare_and_swap(OrderStatus::Pending, next).await
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            if let Swap::Applied(order) = handle.await.unwrap().unwrap() {
                winners.push(order.provider_id);
            }
        }

        assert_eq!(winners.len(), 1);
        let stored = OrderStore::get(store.as_ref(), order.id).await.unwrap().unwrap();
        assert_eq!(stored.provider_id, winners[0]);
    }

    #[tokio::test]
    async fn swap_on_missing_order_is_not_found() {
        let store = MemoryStore::new();
        let result = store
            .compare_and_swap(OrderStatus::Pending, pending_order())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn second_provider_cannot_be_marked_accepted() {
        let store = MemoryStore::new();
        let order_id = Uuid::new_v4();
        let p1 = Uuid::from_u128(1);
        let p2 = Uuid::from_u128(2);

        assert!(store.insert_if_absent(Broadcast::new(order_id, p1)).await.unwrap());
        assert!(store.insert_if_absent(Broadcast::new(order_id, p2)).await.unwrap());
        assert!(!store.insert_if_absent(Broadcast::new(order_id, p1)).await.unwrap());

        assert_eq!(store.mark_accepted(order_id, p1).await.unwrap(), AcceptMark::Marked);
        assert_eq!(
            store.mark_accepted(order_id, p1).await.unwrap(),
            AcceptMark::AlreadyMarked
        );
        assert!(store.mark_accepted(order_id, p2).await.is_err());

        let accepted = store
            .list_for_order(order_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|row| row.accepted)
            .count();
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn older_device_timestamp_does_not_overwrite() {
        let store = MemoryStore::new();
        let order_id = Uuid::new_v4();
        let now = Utc::now();

        let (next, entry) = report(order_id, 1.0, Some(now));
        let first = store.record_report(next, entry).await.unwrap();
        assert!(matches!(first, Upsert::Created(_)));

        let (next, entry) = report(order_id, 2.0, Some(now - Duration::seconds(30)));
        let stale = store.record_report(next, entry).await.unwrap();
        assert!(matches!(stale, Upsert::Stale(_)));

        let (next, entry) = report(order_id, 3.0, None);
        let Upsert::Updated(updated) = store.record_report(next, entry).await.unwrap() else {
            panic!("expected update");
        };
        assert_eq!(updated.reported_at, Some(now));

        let current = TrackingStore::get(&store, order_id).await.unwrap().unwrap();
        assert_eq!(current.current.lat, 3.0);

        let lats: Vec<f64> = TrackingStore::history(&store, order_id)
            .await
            .unwrap()
            .iter()
            .map(|row| row.position.lat)
            .collect();
        assert_eq!(lats, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn stopped_tracking_is_frozen() {
        let store = MemoryStore::new();
        let order_id = Uuid::new_v4();
        let (next, entry) = report(order_id, 1.0, None);
        store.record_report(next, entry).await.unwrap();
        store
            .set_status(order_id, TrackingStatus::Stopped)
            .await
            .unwrap();

        let (next, entry) = report(order_id, 5.0, None);
        let outcome = store.record_report(next, entry).await.unwrap();
        assert!(matches!(outcome, Upsert::Stopped(_)));
        assert_eq!(TrackingStore::history(&store, order_id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn history_tail_matches_current_under_concurrent_reports() {
        let store = Arc::new(MemoryStore::new());
        let order_id = Uuid::new_v4();

        for round in 0..50usize {
            let mut handles = Vec::new();
            for n in 0..8usize {
                let store = store.clone();
                let (next, entry) = report(order_id, (round * 8 + n) as f64 * 0.01, None);
                handles.push(tokio::spawn(async move {
                    store.record_report(next, entry).await
                }));
            }
            for handle in handles {
                handle.await.unwrap().unwrap();
            }

            let current = TrackingStore::get(store.as_ref(), order_id)
                .await
                .unwrap()
                .unwrap();
            let history = TrackingStore::history(store.as_ref(), order_id).await.unwrap();
            assert_eq!(current.current, history.last().unwrap().position);
        }
    }
}
