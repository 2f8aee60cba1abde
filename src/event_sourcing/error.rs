use uuid::Uuid;

use crate::event_sourcing::core::CodecError;
use crate::utils::IsTransient;

// ============================================================================
// Event Store Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer advanced the aggregate first; reload and retry
    #[error(
        "Concurrency conflict on aggregate {aggregate_id}: expected version {expected_version}, \
         current is {}",
        .actual_version.map_or_else(|| "unknown".to_string(), |v| v.to_string())
    )]
    Concurrency {
        aggregate_id: Uuid,
        expected_version: i64,
        actual_version: Option<i64>,
    },

    #[error("Aggregate {aggregate_id} is a {actual}, not a {expected}")]
    AggregateTypeMismatch {
        aggregate_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("Aggregate {aggregate_id} has no version {requested} (latest is {latest})")]
    VersionNotFound {
        aggregate_id: Uuid,
        requested: i64,
        latest: i64,
    },

    #[error("Event history of {aggregate_id} is not contiguous: expected version {expected}, found {found}")]
    BrokenHistory {
        aggregate_id: Uuid,
        expected: i64,
        found: i64,
    },

    #[error("Invalid commit token: {0}")]
    InvalidCommitToken(String),

    #[error("Subscription lease for {0} was already released")]
    LeaseReleased(String),

    #[error("Event codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Snapshot state error: {0}")]
    Snapshot(#[source] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, StoreError::Concurrency { .. })
    }
}

impl IsTransient for StoreError {
    fn is_transient(&self) -> bool {
        self.is_concurrency_conflict()
    }
}

/// Failure of a load-execute-save cycle: either the aggregate refused the
/// command, or persistence failed.
#[derive(Debug, thiserror::Error)]
pub enum CommandError<E: std::error::Error + 'static> {
    #[error("Command rejected: {0}")]
    Domain(#[source] E),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl<E: std::error::Error + 'static> CommandError<E> {
    pub fn domain(&self) -> Option<&E> {
        match self {
            CommandError::Domain(e) => Some(e),
            CommandError::Store(_) => None,
        }
    }
}

impl<E: std::error::Error + 'static> IsTransient for CommandError<E> {
    /// Only a lost version race is worth retrying; domain rejections are final
    fn is_transient(&self) -> bool {
        matches!(self, CommandError::Store(e) if e.is_transient())
    }
}
