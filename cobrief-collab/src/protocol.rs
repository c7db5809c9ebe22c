//! Realtime change events and the presence records they carry.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌────────────┬─────────────┬────────────────┬──────────┬──────────┐
//! │ event_type │ document_id │ participant_id │ sequence │ payload  │
//! │ 1 byte     │ string      │ string         │ varint   │ variable │
//! └────────────┴─────────────┴────────────────┴──────────┴──────────┘
//! ```
//!
//! The payload is itself bincode: a [`ParticipantPresence`] for presence
//! upserts, an [`Operation`] for inserted operations, the flattened text for
//! content changes, and empty for presence deletions.

use cobrief_core::{CollabError, Operation};
use serde::{Deserialize, Serialize};

/// Change notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// A presence row was inserted or updated
    PresenceUpserted = 1,
    /// A presence row was removed
    PresenceDeleted = 2,
    /// An operation was appended to the operations log
    OperationInserted = 3,
    /// The flattened document content changed
    ContentChanged = 4,
}

/// What the participant is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Viewing,
    Editing,
    Idle,
}

/// Scroll state of a participant's viewport.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Viewport {
    pub scroll_top: f64,
    pub scroll_left: f64,
    pub zoom: Option<f64>,
}

impl Viewport {
    pub fn new(scroll_top: f64, scroll_left: f64) -> Self {
        Self {
            scroll_top,
            scroll_left,
            zoom: None,
        }
    }
}

/// Caret and selection in character offsets, plus the viewport around it.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CursorPosition {
    pub from: usize,
    pub to: usize,
    pub selection: bool,
    pub viewport: Option<Viewport>,
}

impl CursorPosition {
    pub fn caret(at: usize) -> Self {
        Self {
            from: at,
            to: at,
            selection: false,
            viewport: None,
        }
    }

    pub fn selection(from: usize, to: usize) -> Self {
        Self {
            from: from.min(to),
            to: from.max(to),
            selection: from != to,
            viewport: None,
        }
    }

    pub fn with_viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = Some(viewport);
        self
    }
}

/// Display metadata supplied on join.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParticipantMetadata {
    pub name: String,
    pub avatar: Option<String>,
    /// CSS color. Empty means "derive from the participant id".
    pub color: String,
}

impl ParticipantMetadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// One presence row, keyed by (document, participant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantPresence {
    pub participant_id: String,
    pub document_id: String,
    pub status: PresenceStatus,
    pub cursor: Option<CursorPosition>,
    /// Milliseconds since the Unix epoch.
    pub last_heartbeat: u64,
    pub joined_at: u64,
    pub metadata: ParticipantMetadata,
}

impl ParticipantPresence {
    /// Whether the last heartbeat falls inside `window_ms` of `now_ms`.
    pub fn is_active(&self, now_ms: u64, window_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat) <= window_ms
    }
}

/// Change notification fanned out to every subscriber of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub event_type: EventType,
    pub document_id: String,
    pub participant_id: String,
    /// Hub-wide sequence number, increasing in publish order.
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl RealtimeEvent {
    pub fn presence_upserted(presence: &ParticipantPresence, sequence: u64) -> Result<Self, ProtocolError> {
        Ok(Self {
            event_type: EventType::PresenceUpserted,
            document_id: presence.document_id.clone(),
            participant_id: presence.participant_id.clone(),
            sequence,
            payload: encode_payload(presence)?,
        })
    }

    pub fn presence_deleted(document_id: &str, participant_id: &str, sequence: u64) -> Self {
        Self {
            event_type: EventType::PresenceDeleted,
            document_id: document_id.to_string(),
            participant_id: participant_id.to_string(),
            sequence,
            payload: Vec::new(),
        }
    }

    pub fn operation_inserted(operation: &Operation, sequence: u64) -> Result<Self, ProtocolError> {
        Ok(Self {
            event_type: EventType::OperationInserted,
            document_id: operation.document_id.clone(),
            participant_id: operation.participant_id.clone(),
            sequence,
            payload: encode_payload(operation)?,
        })
    }

    pub fn content_changed(
        document_id: &str,
        participant_id: &str,
        content: &str,
        sequence: u64,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            event_type: EventType::ContentChanged,
            document_id: document_id.to_string(),
            participant_id: participant_id.to_string(),
            sequence,
            payload: encode_payload(&content)?,
        })
    }

    pub fn is_presence(&self) -> bool {
        matches!(
            self.event_type,
            EventType::PresenceUpserted | EventType::PresenceDeleted
        )
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(event)
    }

    /// Parse a presence upsert payload.
    pub fn presence(&self) -> Result<ParticipantPresence, ProtocolError> {
        if self.event_type != EventType::PresenceUpserted {
            return Err(ProtocolError::InvalidEventType(self.event_type));
        }
        decode_payload(&self.payload)
    }

    /// Parse an inserted operation payload.
    pub fn operation(&self) -> Result<Operation, ProtocolError> {
        if self.event_type != EventType::OperationInserted {
            return Err(ProtocolError::InvalidEventType(self.event_type));
        }
        decode_payload(&self.payload)
    }

    /// Parse a content change payload.
    pub fn content(&self) -> Result<String, ProtocolError> {
        if self.event_type != EventType::ContentChanged {
            return Err(ProtocolError::InvalidEventType(self.event_type));
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidEventType(EventType),
    ChannelClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidEventType(t) => write!(f, "Invalid event type: {t:?}"),
            Self::ChannelClosed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ChannelClosed => CollabError::NetworkFailure(e.to_string()),
            other => CollabError::Serialization(other.to_string()),
        }
    }
}
