//! Persistence seams.
//!
//! The core only relies on per-entity unique keys and atomic conditional
//! updates. [`memory::MemoryStore`] provides both on top of `DashMap` entry
//! locks; a database-backed implementation maps the same calls onto
//! `UPDATE ... WHERE status = $expected` and unique indexes.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::broadcast::Broadcast;
use crate::models::chat::ChatMessage;
use crate::models::order::{Order, OrderStatus};
use crate::models::tracking::{LocationHistory, Tracking, TrackingStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("duplicate {0}")]
    Duplicate(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a compare-and-swap on an order's status.
#[derive(Debug, Clone)]
pub enum Swap {
    Applied(Order),
    /// The stored status no longer matched; carries the current row.
    Stale(Order),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderFilter {
    Pending,
    Active,
    Client(Uuid),
    Provider(Uuid),
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: Order) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Order>, StoreError>;

    /// Replaces the stored order with `next` only if its status still equals
    /// `expected`. The check and the write happen under one lock.
    async fn compare_and_swap(&self, expected: OrderStatus, next: Order)
    -> Result<Swap, StoreError>;

    /// Pending orders oldest first; every other filter newest first.
    async fn list(&self, filter: OrderFilter) -> Result<Vec<Order>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptMark {
    Marked,
    AlreadyMarked,
    /// The provider was never offered this order.
    Missing,
}

#[async_trait]
pub trait BroadcastStore: Send + Sync {
    /// Returns `false` when a row for the same (order, provider) already exists.
    async fn insert_if_absent(&self, broadcast: Broadcast) -> Result<bool, StoreError>;

    async fn list_for_order(&self, order_id: Uuid) -> Result<Vec<Broadcast>, StoreError>;

    /// Flags the provider's row accepted. Fails with [`StoreError::Conflict`]
    /// when another provider's row for the order is already accepted.
    async fn mark_accepted(&self, order_id: Uuid, provider_id: Uuid)
    -> Result<AcceptMark, StoreError>;

    async fn mark_seen(
        &self,
        order_id: Uuid,
        provider_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Broadcast, StoreError>;
}

#[derive(Debug, Clone)]
pub enum Upsert {
    Created(Tracking),
    Updated(Tracking),
    /// The stored row carries a newer device timestamp and was kept.
    Stale(Tracking),
    Stopped(Tracking),
}

#[async_trait]
pub trait TrackingStore: Send + Sync {
    async fn get(&self, order_id: Uuid) -> Result<Option<Tracking>, StoreError>;

    /// Inserts the row, or replaces the existing one keeping its `created_at`,
    /// and appends `entry` to the history while the row is still locked.
    /// A STOPPED row, or one whose `reported_at` is newer than `next.reported_at`,
    /// is left untouched. A STOPPED row also gets no history entry.
    async fn record_report(
        &self,
        next: Tracking,
        entry: LocationHistory,
    ) -> Result<Upsert, StoreError>;

    async fn set_status(
        &self,
        order_id: Uuid,
        status: TrackingStatus,
    ) -> Result<Tracking, StoreError>;

    /// Rows in ingestion order.
    async fn history(&self, order_id: Uuid) -> Result<Vec<LocationHistory>, StoreError>;
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn append(&self, message: ChatMessage) -> Result<(), StoreError>;

    async fn history(&self, order_id: Uuid) -> Result<Vec<ChatMessage>, StoreError>;

    /// Unread messages in the order not sent by `user_id`.
    async fn unread_count(&self, order_id: Uuid, user_id: Uuid) -> Result<usize, StoreError>;

    async fn mark_read(
        &self,
        order_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}
