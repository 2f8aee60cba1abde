use super::value_objects::HttpMethod;

// ============================================================================
// Endpoint Commands - Intentions to change state
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum EndpointCommand {
    Create(CreateEndpoint),
    Update(UpdateEndpoint),
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateEndpoint {
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    pub headers: Option<String>,
    pub body: Option<String>,
    pub owner_id: i64,
    pub recurring_enabled: bool,
    pub recurring_interval: Option<String>,
}

/// Partial update; `None` leaves the field as it is
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateEndpoint {
    pub name: Option<String>,
    pub url: Option<String>,
    pub method: Option<HttpMethod>,
    pub headers: Option<String>,
    pub body: Option<String>,
    pub recurring_enabled: Option<bool>,
    pub recurring_interval: Option<String>,
}

impl UpdateEndpoint {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}
