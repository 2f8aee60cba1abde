// ============================================================================
// Event Sourcing Infrastructure
// ============================================================================
//
// Generic, reusable event sourcing infrastructure.
// Domain-specific code is in src/domain/
//
// - core:         aggregates, domain events, stored events and commit positions
// - store:        append/load with optimistic concurrency, snapshots
// - subscription: commit-ordered delivery of stored events to handlers
//
// ============================================================================

pub mod core;
pub mod error;
pub mod store;
pub mod subscription;

// Re-export core infrastructure
pub use self::core::*;
pub use error::{CommandError, StoreError};
pub use store::*;
pub use subscription::*;
