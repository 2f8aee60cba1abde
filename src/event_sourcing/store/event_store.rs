use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::{EventRepository, Snapshot, SnapshotStore};
use crate::event_sourcing::core::{encode_event, Aggregate, AggregateRoot, DomainEvent, StoredEvent};
use crate::event_sourcing::StoreError;
use crate::metrics::Metrics;

// ============================================================================
// Generic Event Store - Repository for Aggregates
// ============================================================================
//
// Works with ANY aggregate type through the `Aggregate` trait.
//
// Responsibilities:
// 1. Append events under an expected-version precondition (append-only)
// 2. Rebuild aggregates by folding their history, optionally from a snapshot
// 3. Take snapshots according to the configured `SnapshotPolicy`
//
// Snapshots only shorten replay. Removing every snapshot never changes what
// `load` returns.
//
// ============================================================================

/// Snapshot every `interval` versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    interval: i64,
}

impl SnapshotPolicy {
    /// `None` for a non-positive interval, i.e. snapshots disabled
    pub fn every(interval: i64) -> Option<Self> {
        (interval > 0).then_some(Self { interval })
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    /// True when an append moving from `before` to `after` crossed a multiple
    /// of the interval
    pub fn should_snapshot(&self, before: i64, after: i64) -> bool {
        after / self.interval > before / self.interval
    }
}

pub struct EventStore {
    repository: Arc<dyn EventRepository>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    policy: Option<SnapshotPolicy>,
    metrics: Option<Arc<Metrics>>,
}

impl EventStore {
    pub fn new(repository: Arc<dyn EventRepository>) -> Self {
        Self {
            repository,
            snapshots: None,
            policy: None,
            metrics: None,
        }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_snapshot_policy(mut self, policy: Option<SnapshotPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Append events at `expected_version + 1 ..` atomically.
    ///
    /// An empty slice is a no-op. Losing the version race returns
    /// `StoreError::Concurrency`; nothing is written in that case.
    pub async fn append<E: DomainEvent>(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        expected_version: i64,
        events: &[E],
    ) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let encoded = events.iter().map(encode_event).collect::<Result<Vec<_>, _>>()?;

        match self
            .repository
            .append(aggregate_id, aggregate_type, expected_version, encoded)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    aggregate_id = %aggregate_id,
                    aggregate_type = %aggregate_type,
                    new_version = expected_version + events.len() as i64,
                    event_count = events.len(),
                    "✅ Appended events to event store"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_append(aggregate_type, events.len());
                }
                Ok(())
            }
            Err(e) => {
                if e.is_concurrency_conflict() {
                    tracing::warn!(
                        aggregate_id = %aggregate_id,
                        aggregate_type = %aggregate_type,
                        expected_version = expected_version,
                        "Append lost the version race"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_conflict(aggregate_type);
                    }
                }
                Err(e)
            }
        }
    }

    /// Rebuild an aggregate at `version`, or at its latest version when `None`.
    ///
    /// An aggregate that was never written loads as `A::default()` at version 0.
    pub async fn load<A: Aggregate>(
        &self,
        aggregate_id: Uuid,
        version: Option<i64>,
    ) -> Result<AggregateRoot<A>, StoreError> {
        let record = self.repository.aggregate_record(aggregate_id).await?;
        if let Some(record) = &record {
            if record.aggregate_type != A::AGGREGATE_TYPE {
                return Err(StoreError::AggregateTypeMismatch {
                    aggregate_id,
                    expected: A::AGGREGATE_TYPE.to_string(),
                    actual: record.aggregate_type.clone(),
                });
            }
        }
        let latest = record.as_ref().map_or(0, |r| r.current_version);

        if let Some(target) = version {
            if target < 0 {
                return Err(StoreError::VersionNotFound { aggregate_id, requested: target, latest });
            }
        }

        let (mut root, from_snapshot) = match self.seed_from_snapshot::<A>(aggregate_id, version).await? {
            Some(root) => (root, true),
            None => (AggregateRoot::new(aggregate_id), false),
        };

        let events = self
            .repository
            .events(aggregate_id, Some(root.version()), version)
            .await?;

        for stored in &events {
            if stored.aggregate_type != A::AGGREGATE_TYPE {
                return Err(StoreError::AggregateTypeMismatch {
                    aggregate_id,
                    expected: A::AGGREGATE_TYPE.to_string(),
                    actual: stored.aggregate_type.clone(),
                });
            }

            let expected = root.version() + 1;
            if stored.version != expected {
                return Err(StoreError::BrokenHistory { aggregate_id, expected, found: stored.version });
            }

            let event: A::Event = stored.decode()?;
            root.replay(&event, stored.version);
        }

        if let Some(target) = version {
            if root.version() != target {
                return Err(StoreError::VersionNotFound {
                    aggregate_id,
                    requested: target,
                    latest: latest.max(root.version()),
                });
            }
        }

        tracing::debug!(
            aggregate_id = %aggregate_id,
            aggregate_type = %A::AGGREGATE_TYPE,
            version = root.version(),
            replayed = events.len(),
            from_snapshot = from_snapshot,
            "Loaded aggregate"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_load(A::AGGREGATE_TYPE, events.len(), from_snapshot);
        }

        Ok(root)
    }

    async fn seed_from_snapshot<A: Aggregate>(
        &self,
        aggregate_id: Uuid,
        version: Option<i64>,
    ) -> Result<Option<AggregateRoot<A>>, StoreError> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(None);
        };
        let Some(snapshot) = snapshots.latest(aggregate_id, version).await? else {
            return Ok(None);
        };

        if snapshot.aggregate_type != A::AGGREGATE_TYPE {
            tracing::warn!(
                aggregate_id = %aggregate_id,
                snapshot_type = %snapshot.aggregate_type,
                "Ignoring snapshot of a different aggregate type"
            );
            return Ok(None);
        }

        match serde_json::from_value::<A>(snapshot.state) {
            Ok(state) => Ok(Some(AggregateRoot::from_state(aggregate_id, snapshot.version, state))),
            Err(e) => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    snapshot_version = snapshot.version,
                    error = %e,
                    "Ignoring undecodable snapshot, replaying full history"
                );
                Ok(None)
            }
        }
    }

    /// Stored rows with version in `(from_version, to_version]`, ascending
    pub async fn history(
        &self,
        aggregate_id: Uuid,
        from_version: Option<i64>,
        to_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.repository.events(aggregate_id, from_version, to_version).await
    }

    /// Persist the root's uncommitted events and return its new version.
    ///
    /// Takes a snapshot afterwards when the policy asks for one; a failed
    /// snapshot is logged and does not fail the save.
    pub async fn save<A: Aggregate>(&self, root: &mut AggregateRoot<A>) -> Result<i64, StoreError> {
        if !root.has_uncommitted_events() {
            return Ok(root.version());
        }

        let expected_version = root.committed_version();
        let events = root.uncommitted_events();
        self.append(root.id(), A::AGGREGATE_TYPE, expected_version, &events)
            .await?;
        root.mark_committed();

        if let Some(policy) = self.policy {
            if policy.should_snapshot(expected_version, root.version()) {
                if let Err(e) = self.snapshot(root).await {
                    tracing::warn!(
                        aggregate_id = %root.id(),
                        version = root.version(),
                        error = %e,
                        "Failed to take snapshot"
                    );
                }
            }
        }

        Ok(root.version())
    }

    /// Snapshot the root at its current version. Returns false when there is
    /// no snapshot store, or the root still has unsaved events.
    pub async fn snapshot<A: Aggregate>(&self, root: &AggregateRoot<A>) -> Result<bool, StoreError> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(false);
        };
        if root.has_uncommitted_events() || root.version() == 0 {
            return Ok(false);
        }

        let state = serde_json::to_value(root.state()).map_err(StoreError::Snapshot)?;
        snapshots
            .save(Snapshot {
                aggregate_id: root.id(),
                aggregate_type: A::AGGREGATE_TYPE.to_string(),
                version: root.version(),
                state,
                created_at: Utc::now(),
            })
            .await?;

        tracing::debug!(
            aggregate_id = %root.id(),
            version = root.version(),
            "📸 Saved snapshot"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_snapshot(A::AGGREGATE_TYPE);
        }

        Ok(true)
    }
}

// ============================================================================
// Tests
// ============================================================================
