use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::events::EndpointEvent;
use super::value_objects::HttpMethod;
use crate::event_sourcing::core::StoredEvent;
use crate::event_sourcing::subscription::EventHandler;

// ============================================================================
// Endpoint Projection - Read Model
// ============================================================================
//
// Subscription handler that keeps a queryable view of every live endpoint.
// Delivery is at-least-once, so each entry remembers the last version it
// applied and ignores anything at or below it. Deleted endpoints leave a
// tombstone so a redelivered create cannot bring them back.
//
// ============================================================================

pub const ENDPOINT_PROJECTION: &str = "endpoint_projection";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointView {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    pub headers: Option<String>,
    pub body: Option<String>,
    pub owner_id: i64,
    pub recurring_enabled: bool,
    pub recurring_interval: Option<String>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

struct Entry {
    version: i64,
    view: Option<EndpointView>,
}

#[derive(Clone, Default)]
pub struct EndpointProjection {
    entries: Arc<RwLock<HashMap<Uuid, Entry>>>,
}

impl EndpointProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: Uuid) -> Option<EndpointView> {
        self.entries.read().await.get(&id).and_then(|e| e.view.clone())
    }

    /// Live endpoints of one owner, by name
    pub async fn list_by_owner(&self, owner_id: i64) -> Vec<EndpointView> {
        let entries = self.entries.read().await;
        let mut views: Vec<EndpointView> = entries
            .values()
            .filter_map(|e| e.view.as_ref())
            .filter(|v| v.owner_id == owner_id)
            .cloned()
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.values().filter(|e| e.view.is_some()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EventHandler<EndpointEvent> for EndpointProjection {
    async fn handle(&self, event: EndpointEvent, stored: &StoredEvent) -> anyhow::Result<()> {
        let id = stored.aggregate_id;
        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get(&id) {
            if stored.version <= entry.version {
                tracing::debug!(endpoint_id = %id, version = stored.version, "Skipping already applied event");
                return Ok(());
            }
        }

        match event {
            EndpointEvent::Created(e) => {
                tracing::debug!(endpoint_id = %id, "Projecting EndpointCreated");
                entries.insert(
                    id,
                    Entry {
                        version: stored.version,
                        view: Some(EndpointView {
                            id,
                            name: e.name,
                            url: e.url,
                            method: e.method,
                            headers: e.headers,
                            body: e.body,
                            owner_id: e.owner_id,
                            recurring_enabled: e.recurring_enabled,
                            recurring_interval: e.recurring_interval,
                            version: stored.version,
                            updated_at: stored.created_at,
                        }),
                    },
                );
            }
            EndpointEvent::Updated(e) => {
                tracing::debug!(endpoint_id = %id, "Projecting EndpointUpdated");
                let Some(entry) = entries.get_mut(&id) else {
                    anyhow::bail!("endpoint {id} updated before it was created");
                };
                entry.version = stored.version;
                if let Some(view) = entry.view.as_mut() {
                    if let Some(name) = e.name {
                        view.name = name;
                    }
                    if let Some(url) = e.url {
                        view.url = url;
                    }
                    if let Some(method) = e.method {
                        view.method = method;
                    }
                    if e.headers.is_some() {
                        view.headers = e.headers;
                    }
                    if e.body.is_some() {
                        view.body = e.body;
                    }
                    if let Some(enabled) = e.recurring_enabled {
                        view.recurring_enabled = enabled;
                    }
                    if e.recurring_interval.is_some() {
                        view.recurring_interval = e.recurring_interval;
                    }
                    view.version = stored.version;
                    view.updated_at = stored.created_at;
                }
            }
            EndpointEvent::Deleted(_) => {
                tracing::debug!(endpoint_id = %id, "Projecting EndpointDeleted");
                entries.insert(id, Entry { version: stored.version, view: None });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::endpoint::{EndpointCreated, EndpointDeleted, EndpointUpdated};
    use crate::event_sourcing::core::{encode_event, CommitToken};

    fn stored(id: Uuid, version: i64, event: &EndpointEvent) -> StoredEvent {
        let encoded = encode_event(event).unwrap();
        StoredEvent {
            id: version,
            commit_token: CommitToken(version as u64),
            aggregate_id: id,
            aggregate_type: "ApiEndpoint".to_string(),
            version,
            event_kind: encoded.kind,
            payload: encoded.payload,
            created_at: Utc::now(),
        }
    }

    fn created(name: &str, owner_id: i64) -> EndpointEvent {
        EndpointEvent::Created(EndpointCreated {
            name: name.to_string(),
            url: "https://status.example.com".to_string(),
            method: HttpMethod::Get,
            headers: None,
            body: None,
            owner_id,
            recurring_enabled: false,
            recurring_interval: None,
        })
    }

    async fn apply(projection: &EndpointProjection, id: Uuid, version: i64, event: EndpointEvent) {
        let row = stored(id, version, &event);
        projection.handle(event, &row).await.unwrap();
    }

    #[tokio::test]
    async fn test_projection_follows_lifecycle() {
        let projection = EndpointProjection::new();
        let id = Uuid::new_v4();

        apply(&projection, id, 1, created("Status", 3)).await;
        apply(
            &projection,
            id,
            2,
            EndpointEvent::Updated(EndpointUpdated { name: Some("Status page".into()), ..Default::default() }),
        )
        .await;

        let view = projection.get(id).await.unwrap();
        assert_eq!(view.name, "Status page");
        assert_eq!(view.version, 2);

        apply(&projection, id, 3, EndpointEvent::Deleted(EndpointDeleted {})).await;
        assert!(projection.get(id).await.is_none());
        assert!(projection.is_empty().await);
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let projection = EndpointProjection::new();
        let id = Uuid::new_v4();

        apply(&projection, id, 1, created("Status", 3)).await;
        apply(&projection, id, 2, EndpointEvent::Deleted(EndpointDeleted {})).await;
        apply(&projection, id, 1, created("Status", 3)).await;

        assert!(projection.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_list_by_owner_sorted_by_name() {
        let projection = EndpointProjection::new();

        apply(&projection, Uuid::new_v4(), 1, created("zeta", 1)).await;
        apply(&projection, Uuid::new_v4(), 1, created("alpha", 1)).await;
        apply(&projection, Uuid::new_v4(), 1, created("other", 2)).await;

        let names: Vec<String> = projection.list_by_owner(1).await.into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
