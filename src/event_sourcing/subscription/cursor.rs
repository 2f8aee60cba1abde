use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event_sourcing::core::{CommitToken, Position, StoredEvent};
use crate::event_sourcing::StoreError;

// ============================================================================
// Subscription Cursors
// ============================================================================
//
// A cursor is the durable "delivered up to here" marker of one subscription.
// It is only read and written through a `CursorLease`, which holds the
// subscription's exclusive lock (a session advisory lock on PostgreSQL) for
// the whole batch. The lock must not pin the watermark: other subscriptions
// keep moving while one is stuck. Dropping a lease without committing
// releases the lock and leaves the cursor untouched.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCursor {
    pub subscription_name: String,
    pub last_commit_token: Option<CommitToken>,
    pub last_event_id: Option<i64>,
}

impl SubscriptionCursor {
    /// A cursor that has never delivered anything
    pub fn new(subscription_name: &str) -> Self {
        Self {
            subscription_name: subscription_name.to_string(),
            last_commit_token: None,
            last_event_id: None,
        }
    }

    /// Last delivered position; `None` sorts below every event
    pub fn position(&self) -> Option<Position> {
        match (self.last_commit_token, self.last_event_id) {
            (Some(commit_token), Some(event_id)) => Some(Position { commit_token, event_id }),
            _ => None,
        }
    }

    /// True when `position` has not been delivered yet
    pub fn precedes(&self, position: Position) -> bool {
        self.position().map_or(true, |current| position > current)
    }

    /// Move forward to `position`. Returns false (and does nothing) if that
    /// would not be a strict advance.
    pub fn advance_to(&mut self, position: Position) -> bool {
        if !self.precedes(position) {
            return false;
        }
        self.last_commit_token = Some(position.commit_token);
        self.last_event_id = Some(position.event_id);
        true
    }
}

/// An event a handler kept failing on, parked so the subscription can move on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub subscription_name: String,
    pub event_id: i64,
    pub commit_token: CommitToken,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub event_kind: String,
    pub payload: Value,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_event(subscription_name: &str, event: &StoredEvent, error: String, attempts: u32) -> Self {
        Self {
            subscription_name: subscription_name.to_string(),
            event_id: event.id,
            commit_token: event.commit_token,
            aggregate_id: event.aggregate_id,
            aggregate_type: event.aggregate_type.clone(),
            event_kind: event.event_kind.clone(),
            payload: event.payload.clone(),
            error,
            attempts,
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Lock the subscription's cursor, creating it with null markers on first use.
    /// Waits while another lease on the same subscription is alive.
    async fn lease(&self, subscription_name: &str) -> Result<Box<dyn CursorLease>, StoreError>;

    async fn cursor(&self, subscription_name: &str) -> Result<Option<SubscriptionCursor>, StoreError>;

    async fn dead_letters(&self, subscription_name: &str) -> Result<Vec<DeadLetter>, StoreError>;
}

#[async_trait]
pub trait CursorLease: Send {
    fn cursor(&self) -> &SubscriptionCursor;

    /// Oldest commit token still in flight. Everything strictly below it is
    /// either committed or rolled back, so it is safe to deliver in order.
    async fn watermark(&mut self) -> Result<CommitToken, StoreError>;

    /// Undelivered events of `aggregate_type` below `watermark`, ordered by
    /// (commit token, id), at most `limit` of them.
    async fn fetch_batch(
        &mut self,
        aggregate_type: &str,
        watermark: CommitToken,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// Park a poison event; written atomically with the next `commit`
    async fn dead_letter(&mut self, letter: DeadLetter) -> Result<(), StoreError>;

    /// Persist the cursor at `position` (if it is an advance) and release the lock
    async fn commit(&mut self, position: Option<Position>) -> Result<(), StoreError>;
}
