// ============================================================================
// Event Sourcing Core - Generic Infrastructure Abstractions
// ============================================================================
//
// Aggregate and event abstractions shared by the store and the dispatcher.
// No domain-specific code lives here.
//
// ============================================================================

pub mod aggregate;
pub mod event;

// Re-export core types for convenience
pub use aggregate::{Aggregate, AggregateRoot};
pub use event::{
    decode_event, encode_event, CodecError, CommitToken, DomainEvent, EncodedEvent, Position,
    StoredEvent,
};
