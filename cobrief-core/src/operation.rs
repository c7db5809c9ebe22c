//! Document operations exchanged between participants.
//!
//! An [`Operation`] is the unit that flows through the engine, the realtime
//! channel and the persisted operations log. Positions and lengths count
//! Unicode scalar values, never bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{CollabError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Delete,
    Retain,
    Format,
}

/// Value of a formatting attribute. `Null` clears the attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Null,
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

pub type FormatAttributes = BTreeMap<String, AttrValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationPayload {
    None,
    Text(String),
    Attributes(FormatAttributes),
}

/// A single document operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub document_id: String,
    pub participant_id: String,
    pub kind: OperationKind,
    pub position: usize,
    pub payload: OperationPayload,
    /// Span length for delete and format.
    pub length: usize,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Client id of the document replica that produced the operation.
    pub origin_client_id: String,
    /// Encoded CRDT changes carried alongside the positional description.
    /// Receivers merge these when present and fall back to positional
    /// application otherwise.
    pub update: Option<Vec<u8>>,
}

impl Operation {
    fn new(
        document_id: &str,
        participant_id: &str,
        kind: OperationKind,
        position: usize,
        payload: OperationPayload,
        length: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id: document_id.to_string(),
            participant_id: participant_id.to_string(),
            kind,
            position,
            payload,
            length,
            timestamp: 0,
            origin_client_id: String::new(),
            update: None,
        }
    }

    pub fn insert(document_id: &str, participant_id: &str, position: usize, text: &str) -> Self {
        let length = text.chars().count();
        Self::new(
            document_id,
            participant_id,
            OperationKind::Insert,
            position,
            OperationPayload::Text(text.to_string()),
            length,
        )
    }

    pub fn delete(document_id: &str, participant_id: &str, position: usize, length: usize) -> Self {
        Self::new(
            document_id,
            participant_id,
            OperationKind::Delete,
            position,
            OperationPayload::None,
            length,
        )
    }

    pub fn format(
        document_id: &str,
        participant_id: &str,
        position: usize,
        length: usize,
        attributes: FormatAttributes,
    ) -> Self {
        Self::new(
            document_id,
            participant_id,
            OperationKind::Format,
            position,
            OperationPayload::Attributes(attributes),
            length,
        )
    }

    pub fn retain(document_id: &str, participant_id: &str, position: usize) -> Self {
        Self::new(
            document_id,
            participant_id,
            OperationKind::Retain,
            position,
            OperationPayload::None,
            0,
        )
    }

    /// Build the operation that describes an already-applied edit.
    pub fn from_edit(document_id: &str, participant_id: &str, edit: &TextEdit) -> Self {
        match edit {
            TextEdit::Insert { position, text } => {
                Self::insert(document_id, participant_id, *position, text)
            }
            TextEdit::Delete { position, length } => {
                Self::delete(document_id, participant_id, *position, *length)
            }
            TextEdit::Format {
                position,
                length,
                attributes,
            } => Self::format(document_id, participant_id, *position, *length, attributes.clone()),
            TextEdit::Retain => Self::retain(document_id, participant_id, 0),
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_origin_client(mut self, client_id: &str) -> Self {
        self.origin_client_id = client_id.to_string();
        self
    }

    /// Validate the payload against the kind and return the positional edit.
    pub fn edit(&self) -> Result<TextEdit> {
        match (self.kind, &self.payload) {
            (OperationKind::Insert, OperationPayload::Text(text)) if !text.is_empty() => {
                Ok(TextEdit::Insert {
                    position: self.position,
                    text: text.clone(),
                })
            }
            (OperationKind::Insert, _) => Err(CollabError::InvalidOperation(
                "insert requires non-empty text".into(),
            )),
            (OperationKind::Delete, _) if self.length > 0 => Ok(TextEdit::Delete {
                position: self.position,
                length: self.length,
            }),
            (OperationKind::Delete, _) => Err(CollabError::InvalidOperation(
                "delete requires a positive length".into(),
            )),
            (OperationKind::Format, OperationPayload::Attributes(attributes))
                if self.length > 0 && !attributes.is_empty() =>
            {
                Ok(TextEdit::Format {
                    position: self.position,
                    length: self.length,
                    attributes: attributes.clone(),
                })
            }
            (OperationKind::Format, _) => Err(CollabError::InvalidOperation(
                "format requires attributes and a positive length".into(),
            )),
            (OperationKind::Retain, _) => Ok(TextEdit::Retain),
        }
    }
}

/// Positional edit applied to a mergeable document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEdit {
    Insert {
        position: usize,
        text: String,
    },
    Delete {
        position: usize,
        length: usize,
    },
    Format {
        position: usize,
        length: usize,
        attributes: FormatAttributes,
    },
    Retain,
}

impl TextEdit {
    /// Check the edit against a document of `len` characters.
    pub fn check_bounds(&self, len: usize) -> Result<()> {
        let end = match self {
            TextEdit::Insert { position, .. } => *position,
            TextEdit::Delete { position, length } => position.saturating_add(*length),
            TextEdit::Format {
                position, length, ..
            } => position.saturating_add(*length),
            TextEdit::Retain => 0,
        };
        if end > len {
            return Err(CollabError::InvalidOperation(format!(
                "edit ends at {} past document length {}",
                end, len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_counts_chars() {
        let op = Operation::insert("doc", "alice", 0, "héllo");
        assert_eq!(op.length, 5);
        assert_eq!(op.kind, OperationKind::Insert);
        assert!(op.update.is_none());
    }

    #[test]
    fn test_edit_validation() {
        assert!(Operation::insert("doc", "a", 0, "").edit().is_err());
        assert!(Operation::delete("doc", "a", 0, 0).edit().is_err());
        assert!(Operation::format("doc", "a", 0, 3, FormatAttributes::new())
            .edit()
            .is_err());
        assert_eq!(Operation::retain("doc", "a", 4).edit(), Ok(TextEdit::Retain));

        let mut attrs = FormatAttributes::new();
        attrs.insert("bold".into(), AttrValue::Bool(true));
        let edit = Operation::format("doc", "a", 1, 2, attrs.clone()).edit().unwrap();
        assert_eq!(
            edit,
            TextEdit::Format {
                position: 1,
                length: 2,
                attributes: attrs
            }
        );
    }

    #[test]
    fn test_mismatched_payload_rejected() {
        let mut op = Operation::insert("doc", "a", 0, "x");
        op.payload = OperationPayload::None;
        assert!(matches!(op.edit(), Err(CollabError::InvalidOperation(_))));
    }

    #[test]
    fn test_bounds_check() {
        let insert = TextEdit::Insert {
            position: 5,
            text: "x".into(),
        };
        assert!(insert.check_bounds(5).is_ok());
        assert!(insert.check_bounds(4).is_err());

        let delete = TextEdit::Delete {
            position: 3,
            length: 3,
        };
        assert!(delete.check_bounds(6).is_ok());
        assert!(delete.check_bounds(5).is_err());
    }

    #[test]
    fn test_from_edit_matches_kind() {
        let edit = TextEdit::Delete {
            position: 2,
            length: 4,
        };
        let op = Operation::from_edit("doc", "bob", &edit)
            .with_timestamp(42)
            .with_origin_client("c1");
        assert_eq!(op.kind, OperationKind::Delete);
        assert_eq!(op.edit().unwrap(), edit);
        assert_eq!(op.timestamp, 42);
        assert_eq!(op.origin_client_id, "c1");
    }

    #[test]
    fn test_json_roundtrip() {
        let op = Operation::insert("doc", "a", 3, "hey").with_timestamp(7);
        let json = serde_json::to_string(&op).unwrap();
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }
}
