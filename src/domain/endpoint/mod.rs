// ============================================================================
// Endpoint Domain - Business Logic for the ApiEndpoint Aggregate
// ============================================================================
//
// This module contains ALL endpoint-specific code:
// - Value objects (HttpMethod)
// - Events (EndpointCreated, EndpointUpdated, EndpointDeleted)
// - Commands (Create, Update, Delete)
// - Errors (EndpointError enum)
// - Aggregate (ApiEndpoint with business logic)
// - Command Handler (EndpointCommandHandler)
// - Projection (EndpointProjection read model, fed by a subscription)
//
// ============================================================================

pub mod value_objects;
pub mod events;
pub mod commands;
pub mod errors;
pub mod aggregate;
pub mod command_handler;
pub mod projection;

// Re-export for convenience
pub use value_objects::*;
pub use events::*;
pub use commands::*;
pub use errors::*;
pub use aggregate::*;
pub use command_handler::*;
pub use projection::*;
