use serde::{Deserialize, Serialize};

use super::commands::{CreateEndpoint, EndpointCommand, UpdateEndpoint};
use super::errors::EndpointError;
use super::events::*;
use super::value_objects::HttpMethod;
use crate::event_sourcing::core::Aggregate;

// ============================================================================
// ApiEndpoint Aggregate - Domain Logic
// ============================================================================
//
// Lifecycle: (nothing) --Create--> active --Update*--> active --Delete--> deleted
//
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub created: bool,
    pub deleted: bool,

    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    pub headers: Option<String>,
    pub body: Option<String>,
    pub owner_id: i64,

    // Scheduling
    pub recurring_enabled: bool,
    pub recurring_interval: Option<String>,
}

impl ApiEndpoint {
    fn validate_name(name: &str) -> Result<(), EndpointError> {
        if name.trim().is_empty() {
            return Err(EndpointError::EmptyName);
        }
        Ok(())
    }

    fn validate_url(url: &str) -> Result<(), EndpointError> {
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"));
        match rest {
            Some(host) if !host.is_empty() => Ok(()),
            _ => Err(EndpointError::InvalidUrl(url.to_string())),
        }
    }

    fn handle_create(&self, cmd: &CreateEndpoint) -> Result<Vec<EndpointEvent>, EndpointError> {
        if self.created {
            return Err(EndpointError::AlreadyExists);
        }
        Self::validate_name(&cmd.name)?;
        Self::validate_url(&cmd.url)?;
        if cmd.recurring_enabled && cmd.recurring_interval.is_none() {
            return Err(EndpointError::MissingRecurringInterval);
        }

        Ok(vec![EndpointEvent::Created(EndpointCreated {
            name: cmd.name.clone(),
            url: cmd.url.clone(),
            method: cmd.method,
            headers: cmd.headers.clone(),
            body: cmd.body.clone(),
            owner_id: cmd.owner_id,
            recurring_enabled: cmd.recurring_enabled,
            recurring_interval: cmd.recurring_interval.clone(),
        })])
    }

    fn handle_update(&self, cmd: &UpdateEndpoint) -> Result<Vec<EndpointEvent>, EndpointError> {
        if !self.created {
            return Err(EndpointError::NotFound);
        }
        if self.deleted {
            return Err(EndpointError::Deleted);
        }
        if let Some(name) = &cmd.name {
            Self::validate_name(name)?;
        }
        if let Some(url) = &cmd.url {
            Self::validate_url(url)?;
        }
        let recurring = cmd.recurring_enabled.unwrap_or(self.recurring_enabled);
        let interval = cmd.recurring_interval.as_ref().or(self.recurring_interval.as_ref());
        if recurring && interval.is_none() {
            return Err(EndpointError::MissingRecurringInterval);
        }

        // Nothing to record
        if cmd.is_empty() {
            return Ok(vec![]);
        }

        Ok(vec![EndpointEvent::Updated(EndpointUpdated {
            name: cmd.name.clone(),
            url: cmd.url.clone(),
            method: cmd.method,
            headers: cmd.headers.clone(),
            body: cmd.body.clone(),
            recurring_enabled: cmd.recurring_enabled,
            recurring_interval: cmd.recurring_interval.clone(),
        })])
    }

    fn handle_delete(&self) -> Result<Vec<EndpointEvent>, EndpointError> {
        if !self.created {
            return Err(EndpointError::NotFound);
        }
        if self.deleted {
            return Err(EndpointError::AlreadyDeleted);
        }
        Ok(vec![EndpointEvent::Deleted(EndpointDeleted {})])
    }
}

// ============================================================================
// Aggregate Trait Implementation
// ============================================================================

impl Aggregate for ApiEndpoint {
    const AGGREGATE_TYPE: &'static str = "ApiEndpoint";

    type Event = EndpointEvent;
    type Command = EndpointCommand;
    type Error = EndpointError;

    fn apply(&mut self, event: &EndpointEvent) {
        match event {
            EndpointEvent::Created(e) => {
                self.created = true;
                self.deleted = false;
                self.name = e.name.clone();
                self.url = e.url.clone();
                self.method = e.method;
                self.headers = e.headers.clone();
                self.body = e.body.clone();
                self.owner_id = e.owner_id;
                self.recurring_enabled = e.recurring_enabled;
                self.recurring_interval = e.recurring_interval.clone();
            }
            EndpointEvent::Updated(e) => {
                if let Some(name) = &e.name {
                    self.name = name.clone();
                }
                if let Some(url) = &e.url {
                    self.url = url.clone();
                }
                if let Some(method) = e.method {
                    self.method = method;
                }
                if let Some(headers) = &e.headers {
                    self.headers = Some(headers.clone());
                }
                if let Some(body) = &e.body {
                    self.body = Some(body.clone());
                }
                if let Some(enabled) = e.recurring_enabled {
                    self.recurring_enabled = enabled;
                }
                if let Some(interval) = &e.recurring_interval {
                    self.recurring_interval = Some(interval.clone());
                }
            }
            EndpointEvent::Deleted(_) => {
                self.deleted = true;
            }
        }
    }

    fn handle(&self, command: &EndpointCommand) -> Result<Vec<EndpointEvent>, EndpointError> {
        match command {
            EndpointCommand::Create(cmd) => self.handle_create(cmd),
            EndpointCommand::Update(cmd) => self.handle_update(cmd),
            EndpointCommand::Delete => self.handle_delete(),
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
