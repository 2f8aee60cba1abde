// ============================================================================
// Event Sourcing Store - Persistence Layer
// ============================================================================
//
// `EventStore` is what command handlers talk to. It encodes events, folds
// history into aggregates and applies the snapshot policy. The storage
// itself sits behind two traits so the PostgreSQL backend and the in-memory
// log are interchangeable:
//
// - `EventRepository`: atomic append under a version CAS, ranged reads
// - `SnapshotStore`: newest snapshot at or below a version
//
// ============================================================================

pub mod event_store;
pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event_sourcing::core::{EncodedEvent, StoredEvent};
use crate::event_sourcing::StoreError;

pub use event_store::{EventStore, SnapshotPolicy};
pub use in_memory::{InMemoryEventLog, InMemoryTransaction};
pub use postgres::{connect, PostgresEventRepository, PostgresSnapshotStore, PostgresSubscriptionStore};

/// Version ledger row, one per aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub current_version: i64,
}

/// Materialized aggregate state at a known version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub version: i64,
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Append `events` at `expected_version + 1 ..` in one transaction.
    ///
    /// The version row is compared-and-swapped first; the event rows are only
    /// written once that succeeds. A lost race is `StoreError::Concurrency`.
    async fn append(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        expected_version: i64,
        events: Vec<EncodedEvent>,
    ) -> Result<(), StoreError>;

    /// Stored events with version in `(from_version, to_version]`, ascending.
    /// `None` bounds are open.
    async fn events(
        &self,
        aggregate_id: Uuid,
        from_version: Option<i64>,
        to_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    async fn aggregate_record(&self, aggregate_id: Uuid) -> Result<Option<AggregateRecord>, StoreError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Newest snapshot with `version <= max_version` (any version when `None`)
    async fn latest(
        &self,
        aggregate_id: Uuid,
        max_version: Option<i64>,
    ) -> Result<Option<Snapshot>, StoreError>;

    async fn save(&self, snapshot: Snapshot) -> Result<(), StoreError>;
}
