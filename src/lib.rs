//! PostgreSQL event store with optimistic concurrency, snapshots and
//! commit-ordered subscriptions.

pub mod config;
pub mod domain;
pub mod event_sourcing;
pub mod metrics;
pub mod utils;
