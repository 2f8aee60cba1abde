use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::event::DomainEvent;

// ============================================================================
// Aggregate Root Pattern - Event Sourcing Core
// ============================================================================
//
// Key Principles:
// 1. State is derived from events (not stored directly)
// 2. Commands are validated before emitting events
// 3. Events represent facts that have already happened
// 4. All state changes flow through `apply`, which is a pure fold
//
// `Aggregate` is the domain state type. `AggregateRoot` wraps it with the
// identity, version and uncommitted buffer that the event store works with.
//
// ============================================================================

/// Generic Aggregate trait - all event-sourced aggregates implement this
///
/// `Default` is the state before the first event; an aggregate that has never
/// been written loads as the default at version 0. The state must serialize so
/// it can be snapshotted.
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync {
    const AGGREGATE_TYPE: &'static str;

    type Event: DomainEvent;
    type Command;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fold one event into the state. No I/O, no clock, no randomness.
    fn apply(&mut self, event: &Self::Event);

    /// Validate a command against the current state and decide its events
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}

#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    id: Uuid,
    version: i64,
    state: A,
    uncommitted: Vec<A::Event>,
}

impl<A: Aggregate> AggregateRoot<A> {
    pub fn new(id: Uuid) -> Self {
        Self::from_state(id, 0, A::default())
    }

    /// Seed a root from known state at a known version (factory for replay)
    pub fn from_state(id: Uuid, version: i64, state: A) -> Self {
        Self {
            id,
            version,
            state,
            uncommitted: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    /// The version the store holds, i.e. the expected version for the next append
    pub fn committed_version(&self) -> i64 {
        self.version - self.uncommitted.len() as i64
    }

    /// Record a new event: buffer it, fold it, bump the version
    pub fn record(&mut self, event: A::Event) {
        self.state.apply(&event);
        self.uncommitted.push(event);
        self.version += 1;
    }

    /// Run a command; on success every decided event is recorded in order
    pub fn execute(&mut self, command: &A::Command) -> Result<usize, A::Error> {
        let events = self.state.handle(command)?;
        let count = events.len();
        for event in events {
            self.record(event);
        }
        Ok(count)
    }

    pub fn uncommitted_events(&self) -> Vec<A::Event> {
        self.uncommitted.clone()
    }

    pub fn has_uncommitted_events(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Clear the buffer after the store accepted the events
    pub fn mark_committed(&mut self) {
        self.uncommitted.clear();
    }

    /// Fold a persisted event during load. Does not touch the uncommitted buffer.
    pub(crate) fn replay(&mut self, event: &A::Event, version: i64) {
        self.state.apply(event);
        self.version = version;
    }
}

// ============================================================================
// Tests
// ============================================================================
