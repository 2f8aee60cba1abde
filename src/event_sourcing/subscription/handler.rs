use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::event_sourcing::core::{DomainEvent, StoredEvent};

/// Receives the events of one aggregate type, in commit order.
///
/// Delivery is at-least-once: after a crash or a failed batch the same event
/// can arrive again, so implementations must be idempotent. `stored` carries
/// the row metadata (aggregate id, version, position).
#[async_trait]
pub trait EventHandler<E: DomainEvent>: Send + Sync {
    async fn handle(&self, event: E, stored: &StoredEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<E: DomainEvent, H: EventHandler<E>> EventHandler<E> for Arc<H> {
    async fn handle(&self, event: E, stored: &StoredEvent) -> anyhow::Result<()> {
        self.as_ref().handle(event, stored).await
    }
}

/// What the dispatcher actually stores: decode, then hand over
#[async_trait]
pub(crate) trait StoredEventHandler: Send + Sync {
    async fn handle_stored(&self, stored: &StoredEvent) -> anyhow::Result<()>;
}

pub(crate) struct Decoding<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> Decoding<E, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self { handler, _event: PhantomData }
    }
}

#[async_trait]
impl<E, H> StoredEventHandler for Decoding<E, H>
where
    E: DomainEvent,
    H: EventHandler<E>,
{
    async fn handle_stored(&self, stored: &StoredEvent) -> anyhow::Result<()> {
        let event: E = stored.decode()?;
        self.handler.handle(event, stored).await
    }
}
