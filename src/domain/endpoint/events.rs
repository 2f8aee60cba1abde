use serde::{Deserialize, Serialize};

use super::value_objects::HttpMethod;
use crate::event_sourcing::core::DomainEvent;

// ============================================================================
// Endpoint Events - Domain Events for the ApiEndpoint Aggregate
// ============================================================================
//
// Stored as {"kind": "EndpointCreated", "data": {...}}. The kind strings are
// part of the stored format: renaming a variant needs a migration.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum EndpointEvent {
    #[serde(rename = "EndpointCreated")]
    Created(EndpointCreated),
    #[serde(rename = "EndpointUpdated")]
    Updated(EndpointUpdated),
    #[serde(rename = "EndpointDeleted")]
    Deleted(EndpointDeleted),
}

impl DomainEvent for EndpointEvent {
    const KINDS: &'static [&'static str] = &["EndpointCreated", "EndpointUpdated", "EndpointDeleted"];

    fn kind(&self) -> &'static str {
        match self {
            EndpointEvent::Created(_) => "EndpointCreated",
            EndpointEvent::Updated(_) => "EndpointUpdated",
            EndpointEvent::Deleted(_) => "EndpointDeleted",
        }
    }
}

// ============================================================================
// Individual Event Types
// ============================================================================

/// Endpoint Created - first event of every endpoint
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EndpointCreated {
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    pub headers: Option<String>,
    pub body: Option<String>,
    pub owner_id: i64,
    pub recurring_enabled: bool,
    pub recurring_interval: Option<String>,
}

/// Endpoint Updated - only the fields that changed are present
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EndpointUpdated {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<HttpMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring_interval: Option<String>,
}

/// Endpoint Deleted - terminal
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EndpointDeleted {}
