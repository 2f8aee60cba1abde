use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;

// ============================================================================
// Domain Events & Stored Events
// ============================================================================
//
// A domain event is a tagged enum per aggregate type. Its serialized form is
// the full tagged JSON document ({"kind": ..., "data": ...}), and the kind
// is also stored in its own column so subscribers can filter without
// decoding.
//
// ============================================================================

/// Generic Domain Event trait
///
/// Implemented by the per-aggregate event enum. `KINDS` is the closed set of
/// tags the enum can decode; anything else is rejected before serde sees it.
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KINDS: &'static [&'static str];

    fn kind(&self) -> &'static str;
}

/// Ordering value supplied by the database at commit time.
///
/// For PostgreSQL this is the `xid8` of the appending transaction. Row ids are
/// assigned at statement time and do not reflect commit order; this does,
/// once it falls below the visibility watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitToken(pub u64);

impl fmt::Display for CommitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an event in commit order: (commit token, row id).
///
/// Field order matters, the derived `Ord` is lexicographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub commit_token: CommitToken,
    pub event_id: i64,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.commit_token, self.event_id)
    }
}

/// A persisted event row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub commit_token: CommitToken,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub version: i64,
    pub event_kind: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl StoredEvent {
    pub fn position(&self) -> Position {
        Position {
            commit_token: self.commit_token,
            event_id: self.id,
        }
    }

    /// Decode the payload into the aggregate's event enum
    pub fn decode<E: DomainEvent>(&self) -> Result<E, CodecError> {
        decode_event(&self.event_kind, &self.payload)
    }
}

/// An event ready to be written: its kind tag and serialized payload
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedEvent {
    pub kind: String,
    pub payload: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Unknown event kind: {0}")]
    UnknownKind(String),

    #[error("Event kind mismatch: column says {expected}, payload says {found}")]
    KindMismatch { expected: String, found: String },

    #[error("Invalid event JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Event Serialization Helpers
// ============================================================================

pub fn encode_event<E: DomainEvent>(event: &E) -> Result<EncodedEvent, CodecError> {
    Ok(EncodedEvent {
        kind: event.kind().to_string(),
        payload: serde_json::to_value(event)?,
    })
}

pub fn decode_event<E: DomainEvent>(kind: &str, payload: &Value) -> Result<E, CodecError> {
    if !E::KINDS.contains(&kind) {
        return Err(CodecError::UnknownKind(kind.to_string()));
    }

    let event: E = serde_json::from_value(payload.clone())?;
    if event.kind() != kind {
        return Err(CodecError::KindMismatch {
            expected: kind.to_string(),
            found: event.kind().to_string(),
        });
    }

    Ok(event)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    #[serde(tag = "kind", content = "data")]
    enum TestEvent {
        Opened { label: String },
        Closed,
    }

    impl DomainEvent for TestEvent {
        const KINDS: &'static [&'static str] = &["Opened", "Closed"];

        fn kind(&self) -> &'static str {
            match self {
                TestEvent::Opened { .. } => "Opened",
                TestEvent::Closed => "Closed",
            }
        }
    }

    #[test]
    fn test_encoded_payload_carries_kind_tag() {
        let encoded = encode_event(&TestEvent::Opened { label: "a".to_string() }).unwrap();

        assert_eq!(encoded.kind, "Opened");
        assert_eq!(encoded.payload["kind"], "Opened");
        assert_eq!(encoded.payload["data"]["label"], "a");
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let payload = serde_json::json!({ "kind": "Exploded" });
        let result = decode_event::<TestEvent>("Exploded", &payload);

        assert!(matches!(result, Err(CodecError::UnknownKind(k)) if k == "Exploded"));
    }

    #[test]
    fn test_decode_rejects_column_payload_disagreement() {
        let encoded = encode_event(&TestEvent::Closed).unwrap();
        let result = decode_event::<TestEvent>("Opened", &encoded.payload);

        assert!(matches!(result, Err(CodecError::KindMismatch { .. })));
    }

    #[test]
    fn test_position_orders_by_token_before_row_id() {
        let early_commit_late_row = Position { commit_token: CommitToken(5), event_id: 90 };
        let late_commit_early_row = Position { commit_token: CommitToken(6), event_id: 10 };
        let same_commit_next_row = Position { commit_token: CommitToken(5), event_id: 91 };

        assert!(early_commit_late_row < late_commit_early_row);
        assert!(early_commit_late_row < same_commit_next_row);
        assert!(same_commit_next_row < late_commit_early_row);
    }
}
