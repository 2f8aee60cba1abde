// ============================================================================
// Subscriptions - Commit-Ordered Event Delivery
// ============================================================================
//
// Read-model builders and other downstream consumers register an
// `EventHandler` under a durable subscription name. The dispatcher polls the
// log, and each subscription sees the events of its aggregate type exactly in
// commit order, without gaps, at least once.
//
// ============================================================================

pub mod cursor;
pub mod dispatcher;
pub mod handler;

pub use cursor::{CursorLease, DeadLetter, SubscriptionCursor, SubscriptionStore};
pub use dispatcher::{
    BatchOutcome, DispatchError, DispatcherConfig, DispatcherHandle, PoisonPolicy, SubscriptionDispatcher,
    SubscriptionReport,
};
pub use handler::EventHandler;
