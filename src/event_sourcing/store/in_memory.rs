use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{AggregateRecord, EventRepository, Snapshot, SnapshotStore};
use crate::event_sourcing::core::{CommitToken, EncodedEvent, Position, StoredEvent};
use crate::event_sourcing::subscription::{CursorLease, DeadLetter, SubscriptionCursor, SubscriptionStore};
use crate::event_sourcing::StoreError;

// ============================================================================
// In-Memory Event Log
// ============================================================================
//
// Models the PostgreSQL backend closely enough to exercise the ordering
// protocol without a database:
//
// - a commit token is handed out on a transaction's first write, the way
//   PostgreSQL assigns an xid lazily; read-only transactions never get one
// - row ids are handed out when an event is inserted, not when it commits
// - events become visible only on commit
// - the watermark is the oldest in-flight token, or the next token if idle
//
// A version row claimed by an open transaction makes other writers fail
// fast with a concurrency conflict instead of blocking on the row lock.
//
// ============================================================================

struct Claim {
    token: u64,
    aggregate_type: String,
    version: i64,
}

struct LogState {
    next_token: u64,
    next_event_id: i64,
    in_flight: BTreeSet<u64>,
    records: HashMap<Uuid, AggregateRecord>,
    claims: HashMap<Uuid, Claim>,
    events: Vec<StoredEvent>,
    snapshots: HashMap<Uuid, BTreeMap<i64, Snapshot>>,
    cursors: HashMap<String, SubscriptionCursor>,
    dead_letters: Vec<DeadLetter>,
}

impl LogState {
    fn watermark(&self) -> CommitToken {
        CommitToken(self.in_flight.first().copied().unwrap_or(self.next_token))
    }
}

fn lock(state: &Mutex<LogState>) -> MutexGuard<'_, LogState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct InMemoryEventLog {
    state: Arc<Mutex<LogState>>,
    subscription_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LogState {
                next_token: 1,
                next_event_id: 1,
                in_flight: BTreeSet::new(),
                records: HashMap::new(),
                claims: HashMap::new(),
                events: Vec::new(),
                snapshots: HashMap::new(),
                cursors: HashMap::new(),
                dead_letters: Vec::new(),
            })),
            subscription_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Open a transaction. From its first append until it is committed,
    /// rolled back or dropped it holds the watermark back.
    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            state: self.state.clone(),
            token: None,
            pending: Vec::new(),
            claimed: Vec::new(),
            finished: false,
        }
    }

    pub fn watermark(&self) -> CommitToken {
        lock(&self.state).watermark()
    }

    /// All committed events in row id order
    pub fn committed_events(&self) -> Vec<StoredEvent> {
        let mut events = lock(&self.state).events.clone();
        events.sort_by_key(|e| e.id);
        events
    }

    /// Remove every snapshot; loads must behave exactly as before
    pub fn clear_snapshots(&self) {
        lock(&self.state).snapshots.clear();
    }
}

pub struct InMemoryTransaction {
    state: Arc<Mutex<LogState>>,
    token: Option<CommitToken>,
    pending: Vec<StoredEvent>,
    claimed: Vec<Uuid>,
    finished: bool,
}

impl InMemoryTransaction {
    /// `None` until the first append
    pub fn commit_token(&self) -> Option<CommitToken> {
        self.token
    }

    pub fn append(
        &mut self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        expected_version: i64,
        events: Vec<EncodedEvent>,
    ) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut state = lock(&self.state);
        let committed = state.records.get(&aggregate_id).map(|r| r.current_version);

        let own_claim = state
            .claims
            .get(&aggregate_id)
            .filter(|claim| Some(CommitToken(claim.token)) == self.token);
        let known_type = own_claim
            .map(|claim| claim.aggregate_type.as_str())
            .or_else(|| state.records.get(&aggregate_id).map(|r| r.aggregate_type.as_str()));
        if let Some(known_type) = known_type {
            if known_type != aggregate_type {
                return Err(StoreError::AggregateTypeMismatch {
                    aggregate_id,
                    expected: aggregate_type.to_string(),
                    actual: known_type.to_string(),
                });
            }
        }

        let current = match state.claims.get(&aggregate_id) {
            Some(claim) if Some(CommitToken(claim.token)) == self.token => Some(claim.version),
            Some(_) => {
                return Err(StoreError::Concurrency {
                    aggregate_id,
                    expected_version,
                    actual_version: committed,
                })
            }
            None => committed,
        };

        if current.unwrap_or(0) != expected_version {
            return Err(StoreError::Concurrency {
                aggregate_id,
                expected_version,
                actual_version: Some(current.unwrap_or(0)),
            });
        }

        let token = match self.token {
            Some(token) => token,
            None => {
                let token = CommitToken(state.next_token);
                state.next_token += 1;
                state.in_flight.insert(token.0);
                self.token = Some(token);
                token
            }
        };

        let new_version = expected_version + events.len() as i64;
        if !self.claimed.contains(&aggregate_id) {
            self.claimed.push(aggregate_id);
        }
        state.claims.insert(
            aggregate_id,
            Claim {
                token: token.0,
                aggregate_type: aggregate_type.to_string(),
                version: new_version,
            },
        );

        let now = Utc::now();
        for (offset, event) in events.into_iter().enumerate() {
            let id = state.next_event_id;
            state.next_event_id += 1;
            self.pending.push(StoredEvent {
                id,
                commit_token: token,
                aggregate_id,
                aggregate_type: aggregate_type.to_string(),
                version: expected_version + 1 + offset as i64,
                event_kind: event.kind,
                payload: event.payload,
                created_at: now,
            });
        }

        Ok(())
    }

    pub fn commit(mut self) {
        self.finish(true);
    }

    pub fn rollback(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, keep: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        let mut state = lock(&self.state);
        if let Some(token) = self.token {
            state.in_flight.remove(&token.0);
        }

        for aggregate_id in self.claimed.drain(..) {
            let Some(claim) = state.claims.remove(&aggregate_id) else {
                continue;
            };
            if keep {
                state.records.insert(
                    aggregate_id,
                    AggregateRecord {
                        aggregate_id,
                        aggregate_type: claim.aggregate_type,
                        current_version: claim.version,
                    },
                );
            }
        }

        if keep {
            let pending = std::mem::take(&mut self.pending);
            state.events.extend(pending);
        }
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.finish(false);
    }
}

#[async_trait]
impl EventRepository for InMemoryEventLog {
    async fn append(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        expected_version: i64,
        events: Vec<EncodedEvent>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin();
        tx.append(aggregate_id, aggregate_type, expected_version, events)?;
        tx.commit();
        Ok(())
    }

    async fn events(
        &self,
        aggregate_id: Uuid,
        from_version: Option<i64>,
        to_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let state = lock(&self.state);
        let mut events: Vec<StoredEvent> = state
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .filter(|e| from_version.map_or(true, |from| e.version > from))
            .filter(|e| to_version.map_or(true, |to| e.version <= to))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn aggregate_record(&self, aggregate_id: Uuid) -> Result<Option<AggregateRecord>, StoreError> {
        Ok(lock(&self.state).records.get(&aggregate_id).cloned())
    }
}

#[async_trait]
impl SnapshotStore for InMemoryEventLog {
    async fn latest(
        &self,
        aggregate_id: Uuid,
        max_version: Option<i64>,
    ) -> Result<Option<Snapshot>, StoreError> {
        let state = lock(&self.state);
        let Some(snapshots) = state.snapshots.get(&aggregate_id) else {
            return Ok(None);
        };
        let found = match max_version {
            Some(max) => snapshots.range(..=max).next_back(),
            None => snapshots.iter().next_back(),
        };
        Ok(found.map(|(_, snapshot)| snapshot.clone()))
    }

    async fn save(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        state
            .snapshots
            .entry(snapshot.aggregate_id)
            .or_default()
            .entry(snapshot.version)
            .or_insert(snapshot);
        Ok(())
    }
}

// ============================================================================
// Subscription cursors
// ============================================================================

struct InMemoryLease {
    state: Arc<Mutex<LogState>>,
    cursor: SubscriptionCursor,
    dead_letters: Vec<DeadLetter>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl CursorLease for InMemoryLease {
    fn cursor(&self) -> &SubscriptionCursor {
        &self.cursor
    }

    async fn watermark(&mut self) -> Result<CommitToken, StoreError> {
        Ok(lock(&self.state).watermark())
    }

    async fn fetch_batch(
        &mut self,
        aggregate_type: &str,
        watermark: CommitToken,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let state = lock(&self.state);
        let mut batch: Vec<StoredEvent> = state
            .events
            .iter()
            .filter(|e| e.aggregate_type == aggregate_type)
            .filter(|e| e.commit_token < watermark)
            .filter(|e| self.cursor.precedes(e.position()))
            .cloned()
            .collect();
        batch.sort_by_key(|e| e.position());
        batch.truncate(limit);
        Ok(batch)
    }

    async fn dead_letter(&mut self, letter: DeadLetter) -> Result<(), StoreError> {
        self.dead_letters.push(letter);
        Ok(())
    }

    async fn commit(&mut self, position: Option<Position>) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let stored = state
            .cursors
            .entry(self.cursor.subscription_name.clone())
            .or_insert_with(|| SubscriptionCursor::new(&self.cursor.subscription_name));
        if let Some(position) = position {
            stored.advance_to(position);
        }
        self.cursor = stored.clone();

        for letter in std::mem::take(&mut self.dead_letters) {
            let parked = state.dead_letters.iter_mut().find(|l| {
                l.subscription_name == letter.subscription_name && l.event_id == letter.event_id
            });
            match parked {
                Some(parked) => {
                    parked.attempts += letter.attempts;
                    parked.error = letter.error;
                    parked.failed_at = letter.failed_at;
                }
                None => state.dead_letters.push(letter),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryEventLog {
    async fn lease(&self, subscription_name: &str) -> Result<Box<dyn CursorLease>, StoreError> {
        let row_lock = {
            let mut locks = self
                .subscription_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks.entry(subscription_name.to_string()).or_default().clone()
        };
        let guard = row_lock.lock_owned().await;

        let cursor = lock(&self.state)
            .cursors
            .entry(subscription_name.to_string())
            .or_insert_with(|| SubscriptionCursor::new(subscription_name))
            .clone();

        Ok(Box::new(InMemoryLease {
            state: self.state.clone(),
            cursor,
            dead_letters: Vec::new(),
            _guard: guard,
        }))
    }

    async fn cursor(&self, subscription_name: &str) -> Result<Option<SubscriptionCursor>, StoreError> {
        Ok(lock(&self.state).cursors.get(subscription_name).cloned())
    }

    async fn dead_letters(&self, subscription_name: &str) -> Result<Vec<DeadLetter>, StoreError> {
        Ok(lock(&self.state)
            .dead_letters
            .iter()
            .filter(|l| l.subscription_name == subscription_name)
            .cloned()
            .collect())
    }
}
