// ============================================================================
// Endpoint Business Rule Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EndpointError {
    #[error("API endpoint already exists")]
    AlreadyExists,

    #[error("API endpoint does not exist")]
    NotFound,

    #[error("Cannot update deleted API endpoint")]
    Deleted,

    #[error("API endpoint already deleted")]
    AlreadyDeleted,

    #[error("Endpoint name cannot be empty")]
    EmptyName,

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Recurring endpoints need an interval")]
    MissingRecurringInterval,
}
