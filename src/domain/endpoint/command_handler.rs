use std::sync::Arc;

use uuid::Uuid;

use super::aggregate::ApiEndpoint;
use super::commands::{CreateEndpoint, EndpointCommand};
use super::errors::EndpointError;
use crate::event_sourcing::core::AggregateRoot;
use crate::event_sourcing::store::EventStore;
use crate::event_sourcing::CommandError;
use crate::utils::{retry_on_transient, RetryConfig};

// ============================================================================
// Endpoint Command Handler
// ============================================================================
//
// Orchestrates: Command → Aggregate → Events → Event Store
//
// A cycle that loses the version race fails with a concurrency error. With
// `with_conflict_retry` the whole cycle is re-run from a fresh load instead.
//
// ============================================================================

pub type EndpointCommandError = CommandError<EndpointError>;

pub struct EndpointCommandHandler {
    event_store: Arc<EventStore>,
    conflict_retry: Option<RetryConfig>,
}

impl EndpointCommandHandler {
    pub fn new(event_store: Arc<EventStore>) -> Self {
        Self {
            event_store,
            conflict_retry: None,
        }
    }

    pub fn with_conflict_retry(mut self, config: RetryConfig) -> Self {
        self.conflict_retry = Some(config);
        self
    }

    /// Create a new endpoint under a fresh id
    pub async fn create(&self, command: CreateEndpoint) -> Result<Uuid, EndpointCommandError> {
        let endpoint_id = Uuid::now_v7();
        self.handle(endpoint_id, EndpointCommand::Create(command)).await?;
        Ok(endpoint_id)
    }

    /// Handle a command and persist resulting events.
    /// Returns the endpoint's version afterwards.
    pub async fn handle(
        &self,
        endpoint_id: Uuid,
        command: EndpointCommand,
    ) -> Result<i64, EndpointCommandError> {
        match &self.conflict_retry {
            None => self.execute(endpoint_id, &command).await,
            Some(config) => retry_on_transient(config.clone(), |_attempt| self.execute(endpoint_id, &command))
                .await
                .into_result(),
        }
    }

    /// Current state of an endpoint, straight from its event history
    pub async fn load(&self, endpoint_id: Uuid) -> Result<AggregateRoot<ApiEndpoint>, EndpointCommandError> {
        Ok(self.event_store.load(endpoint_id, None).await?)
    }

    async fn execute(&self, endpoint_id: Uuid, command: &EndpointCommand) -> Result<i64, EndpointCommandError> {
        let mut endpoint: AggregateRoot<ApiEndpoint> = self.event_store.load(endpoint_id, None).await?;

        endpoint.execute(command).map_err(CommandError::Domain)?;
        let version = self.event_store.save(&mut endpoint).await?;

        tracing::debug!(
            endpoint_id = %endpoint_id,
            version = version,
            "Handled endpoint command"
        );
        Ok(version)
    }
}
