//! Lifecycle events that start workflow runs

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketCreated {
    pub ticket_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketResolved {
    pub ticket_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub related_skills: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSignup {
    pub email: String,
}

/// An event as published, tagged by name with its payload under `data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum TriageEvent {
    #[serde(rename = "ticket/created")]
    TicketCreated(TicketCreated),
    #[serde(rename = "ticket/resolved")]
    TicketResolved(TicketResolved),
    #[serde(rename = "user/signup")]
    UserSignup(UserSignup),
}

impl TriageEvent {
    pub const TICKET_CREATED: &'static str = "ticket/created";
    pub const TICKET_RESOLVED: &'static str = "ticket/resolved";
    pub const USER_SIGNUP: &'static str = "user/signup";

    pub fn name(&self) -> &'static str {
        match self {
            TriageEvent::TicketCreated(_) => Self::TICKET_CREATED,
            TriageEvent::TicketResolved(_) => Self::TICKET_RESOLVED,
            TriageEvent::UserSignup(_) => Self::USER_SIGNUP,
        }
    }

    /// Event payload as JSON with keys in sorted order
    pub fn payload(&self) -> Result<serde_json::Value> {
        let value = match self {
            TriageEvent::TicketCreated(data) => serde_json::to_value(data)?,
            TriageEvent::TicketResolved(data) => serde_json::to_value(data)?,
            TriageEvent::UserSignup(data) => serde_json::to_value(data)?,
        };
        Ok(value)
    }

    /// Rebuild an event from its name and payload
    pub fn from_parts(name: &str, payload: serde_json::Value) -> Result<Self> {
        serde_json::from_value(serde_json::json!({ "name": name, "data": payload }))
            .map_err(|e| Error::InvalidPayload(format!("{}: {}", name, e)))
    }
}

/// An event together with the id that names its occurrence.
///
/// Two envelopes with the same id are the same occurrence, so they map to the
/// same run of every workflow function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub event: TriageEvent,
}

impl EventEnvelope {
    /// Wrap `event`, deriving its id from the name and canonical payload
    pub fn new(event: TriageEvent) -> Result<Self> {
        let id = derive_event_id(&event)?;
        Ok(Self { id, event })
    }

    pub fn with_id(id: impl Into<String>, event: TriageEvent) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() || id.contains(':') {
            return Err(Error::InvalidPayload(format!(
                "event id '{}' must be non-empty and free of ':'",
                id
            )));
        }
        Ok(Self { id, event })
    }

    pub fn name(&self) -> &'static str {
        self.event.name()
    }
}

/// SHA-256 over the event name and its payload serialized with sorted keys
pub fn derive_event_id(event: &TriageEvent) -> Result<String> {
    let payload = event.payload()?;
    let mut hasher = Sha256::new();
    hasher.update(event.name().as_bytes());
    hasher.update(b"\n");
    hasher.update(serde_json::to_string(&payload)?.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(id: &str) -> TriageEvent {
        TriageEvent::TicketCreated(TicketCreated {
            ticket_id: id.to_string(),
            title: "Login broken".into(),
            description: "500".into(),
            created_by: None,
        })
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(created("abc")).unwrap();
        assert_eq!(json["name"], "ticket/created");
        assert_eq!(json["data"]["ticketId"], "abc");

        let parsed: TriageEvent = serde_json::from_value(serde_json::json!({
            "name": "ticket/resolved",
            "data": {"ticketId": "abc", "resolution": "fixed", "relatedSkills": ["SQL"]}
        }))
        .unwrap();
        assert_eq!(parsed.name(), TriageEvent::TICKET_RESOLVED);
    }

    #[test]
    fn test_derived_ids_are_stable() {
        let a = EventEnvelope::new(created("abc")).unwrap();
        let b = EventEnvelope::new(created("abc")).unwrap();
        let c = EventEnvelope::new(created("abd")).unwrap();

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.id.len(), 64);
    }

    #[test]
    fn test_explicit_id_validation() {
        assert!(EventEnvelope::with_id("evt-1", created("abc")).is_ok());
        assert!(EventEnvelope::with_id("", created("abc")).is_err());
        assert!(EventEnvelope::with_id("a:b", created("abc")).is_err());
    }

    #[test]
    fn test_from_parts_rejects_bad_payload() {
        let err = TriageEvent::from_parts("user/signup", serde_json::json!({"mail": "x"})).unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));

        let event = TriageEvent::from_parts("user/signup", serde_json::json!({"email": "a@b.c"})).unwrap();
        assert_eq!(event.name(), "user/signup");
    }
}
