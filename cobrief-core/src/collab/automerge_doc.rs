//! Automerge-backed [`MergeableDocument`].

use automerge::marks::{ExpandMark, Mark};
use automerge::transaction::{CommitOptions, Transactable};
use automerge::{
    ActorId, AutoCommit, ChangeHash, Cursor, CursorPosition, LoadOptions, ObjId, ObjType,
    ReadDoc, ScalarValue, TextEncoding, Value, ROOT,
};

use super::{ChangeObserver, DocumentChange, MergeableDocument, StateVector};
use crate::error::{CollabError, Result};
use crate::operation::{AttrValue, FormatAttributes, TextEdit};

const CONTENT_KEY: &str = "content";

/// Actor used for the seeding change. Every replica seeded with the same
/// content produces a byte-identical first change, so histories line up.
const GENESIS_ACTOR: [u8; 16] = *b"cobrief:genesis!";

pub struct AutomergeText {
    doc: AutoCommit,
    text: ObjId,
    observers: Vec<ChangeObserver>,
}

impl AutomergeText {
    fn from_doc(mut doc: AutoCommit) -> Result<Self> {
        doc.set_actor(ActorId::random());
        let text = match doc.get(ROOT, CONTENT_KEY)? {
            Some((Value::Object(ObjType::Text), id)) => id,
            _ => return Err(CollabError::Crdt("document has no text content".into())),
        };
        Ok(Self {
            doc,
            text,
            observers: Vec::new(),
        })
    }

    /// New replica sharing this one's history, with its own actor.
    pub fn fork(&mut self) -> Result<Self> {
        Self::from_doc(self.doc.fork())
    }

    fn notify(&self, update: &[u8], origin: &str) {
        if self.observers.is_empty() {
            return;
        }
        let change = DocumentChange {
            update: update.to_vec(),
            origin: origin.to_string(),
        };
        for observer in &self.observers {
            observer(&change);
        }
    }
}

fn to_scalar(value: &AttrValue) -> Option<ScalarValue> {
    match value {
        AttrValue::Bool(b) => Some(ScalarValue::Boolean(*b)),
        AttrValue::Int(i) => Some(ScalarValue::Int(*i)),
        AttrValue::Str(s) => Some(ScalarValue::from(s.as_str())),
        AttrValue::Null => None,
    }
}

fn from_scalar(value: &ScalarValue) -> Option<AttrValue> {
    match value {
        ScalarValue::Null => None,
        ScalarValue::Boolean(b) => Some(AttrValue::Bool(*b)),
        ScalarValue::Int(i) => Some(AttrValue::Int(*i)),
        ScalarValue::Uint(u) => Some(AttrValue::Int(*u as i64)),
        ScalarValue::Str(s) => Some(AttrValue::Str(s.to_string())),
        other => Some(AttrValue::Str(other.to_string())),
    }
}

impl MergeableDocument for AutomergeText {
    type Anchor = Cursor;

    fn genesis(content: &str) -> Result<Self> {
        let mut doc = AutoCommit::new_with_encoding(TextEncoding::UnicodeCodePoint)
            .with_actor(ActorId::from(GENESIS_ACTOR));
        let text = doc.put_object(ROOT, CONTENT_KEY, ObjType::Text)?;
        if !content.is_empty() {
            doc.splice_text(&text, 0, 0, content)?;
        }
        doc.commit_with(CommitOptions::default().with_time(0));
        Self::from_doc(doc)
    }

    fn load(state: &[u8]) -> Result<Self> {
        let doc = AutoCommit::load_with_options(
            state,
            LoadOptions::new().text_encoding(TextEncoding::UnicodeCodePoint),
        )?;
        Self::from_doc(doc)
    }

    fn client_id(&self) -> String {
        self.doc.get_actor().to_hex_string()
    }

    fn apply_local(&mut self, edit: &TextEdit, origin: &str) -> Result<Vec<u8>> {
        edit.check_bounds(self.len())?;
        let before = self.doc.get_heads();

        match edit {
            TextEdit::Insert { position, text } => {
                self.doc.splice_text(&self.text, *position, 0, text)?;
            }
            TextEdit::Delete { position, length } => {
                self.doc
                    .splice_text(&self.text, *position, *length as isize, "")?;
            }
            TextEdit::Format {
                position,
                length,
                attributes,
            } => {
                let end = position + length;
                for (name, value) in attributes {
                    match to_scalar(value) {
                        Some(scalar) => self.doc.mark(
                            &self.text,
                            Mark::new(name.clone(), scalar, *position, end),
                            ExpandMark::After,
                        )?,
                        None => {
                            self.doc
                                .unmark(&self.text, name, *position, end, ExpandMark::After)?
                        }
                    }
                }
            }
            TextEdit::Retain => return Ok(Vec::new()),
        }

        self.doc
            .commit_with(CommitOptions::default().with_message(origin.to_string()));
        let update = self.doc.save_after(&before);
        self.notify(&update, origin);
        Ok(update)
    }

    fn apply_remote(&mut self, update: &[u8], origin: &str) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let before = self.doc.get_heads();
        self.doc.load_incremental(update)?;
        if self.doc.get_heads() != before {
            self.notify(update, origin);
        }
        Ok(())
    }

    fn snapshot(&self) -> String {
        self.doc.text(&self.text).unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.doc.length(&self.text)
    }

    fn attributes_at(&self, position: usize) -> FormatAttributes {
        let Ok(marks) = self.doc.get_marks(&self.text, position, None) else {
            return FormatAttributes::new();
        };
        marks
            .iter()
            .filter_map(|(name, value)| from_scalar(value).map(|v| (name.to_string(), v)))
            .collect()
    }

    fn anchor_at(&self, position: usize) -> Result<Cursor> {
        let len = self.len();
        if position > len {
            return Err(CollabError::InvalidOperation(format!(
                "anchor {} past document length {}",
                position, len
            )));
        }
        let at = if position == len {
            CursorPosition::End
        } else {
            CursorPosition::Index(position)
        };
        Ok(self.doc.get_cursor(&self.text, at, None)?)
    }

    fn resolve_anchor(&self, anchor: &Cursor) -> Option<usize> {
        self.doc.get_cursor_position(&self.text, anchor, None).ok()
    }

    fn state_vector(&mut self) -> StateVector {
        StateVector(
            self.doc
                .get_heads()
                .into_iter()
                .map(|h| h.0.to_vec())
                .collect(),
        )
    }

    fn encode_since(&mut self, since: &StateVector) -> Result<Vec<u8>> {
        let heads = since
            .0
            .iter()
            .map(|bytes| {
                ChangeHash::try_from(bytes.as_slice())
                    .map_err(|e| CollabError::Crdt(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.doc.save_after(&heads))
    }

    fn encode_state(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    fn observe(&mut self, observer: ChangeObserver) {
        self.observers.push(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn insert(position: usize, text: &str) -> TextEdit {
        TextEdit::Insert {
            position,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_genesis_content() {
        let doc = AutomergeText::genesis("Hello world").unwrap();
        assert_eq!(doc.snapshot(), "Hello world");
        assert_eq!(doc.len(), 11);
    }

    #[test]
    fn test_replicas_have_distinct_client_ids() {
        let a = AutomergeText::genesis("").unwrap();
        let b = AutomergeText::genesis("").unwrap();
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn test_independent_genesis_replicas_merge() {
        let mut a = AutomergeText::genesis("Hello world").unwrap();
        let mut b = AutomergeText::genesis("Hello world").unwrap();

        let ua = a.apply_local(&insert(0, "Big "), "alice").unwrap();
        let ub = b.apply_local(&insert(11, "!"), "bob").unwrap();

        a.apply_remote(&ub, "bob").unwrap();
        b.apply_remote(&ua, "alice").unwrap();

        assert_eq!(a.snapshot(), "Big Hello world!");
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_unicode_positions_are_chars() {
        let mut doc = AutomergeText::genesis("héllo").unwrap();
        doc.apply_local(&insert(2, "X"), "a").unwrap();
        assert_eq!(doc.snapshot(), "héXllo");
        doc.apply_local(
            &TextEdit::Delete {
                position: 1,
                length: 1,
            },
            "a",
        )
        .unwrap();
        assert_eq!(doc.snapshot(), "hXllo");
    }

    #[test]
    fn test_out_of_bounds_edit_rejected() {
        let mut doc = AutomergeText::genesis("abc").unwrap();
        let err = doc.apply_local(&insert(4, "x"), "a").unwrap_err();
        assert!(matches!(err, CollabError::InvalidOperation(_)));
        assert_eq!(doc.snapshot(), "abc");
    }

    #[test]
    fn test_format_sets_and_clears_attributes() {
        let mut doc = AutomergeText::genesis("bold text").unwrap();
        let mut attrs = FormatAttributes::new();
        attrs.insert("bold".into(), AttrValue::Bool(true));
        doc.apply_local(
            &TextEdit::Format {
                position: 0,
                length: 4,
                attributes: attrs,
            },
            "a",
        )
        .unwrap();
        assert_eq!(doc.attributes_at(1).get("bold"), Some(&AttrValue::Bool(true)));
        assert!(doc.attributes_at(6).is_empty());

        let mut clear = FormatAttributes::new();
        clear.insert("bold".into(), AttrValue::Null);
        doc.apply_local(
            &TextEdit::Format {
                position: 0,
                length: 4,
                attributes: clear,
            },
            "a",
        )
        .unwrap();
        assert!(doc.attributes_at(1).get("bold").is_none());
    }

    #[test]
    fn test_anchor_follows_remote_insert() {
        let mut a = AutomergeText::genesis("world").unwrap();
        let mut b = a.fork().unwrap();
        let anchor = a.anchor_at(0).unwrap();

        let update = b.apply_local(&insert(0, "hello "), "bob").unwrap();
        a.apply_remote(&update, "bob").unwrap();

        assert_eq!(a.resolve_anchor(&anchor), Some(6));
        let end = a.anchor_at(a.len()).unwrap();
        a.apply_local(&insert(a.len(), "!"), "a").unwrap();
        assert_eq!(a.resolve_anchor(&end), Some(a.len()));
    }

    #[test]
    fn test_encode_since_carries_unsent_changes() {
        let mut a = AutomergeText::genesis("").unwrap();
        let mut b = AutomergeText::genesis("").unwrap();
        let acked = a.state_vector();

        a.apply_local(&insert(0, "A"), "a").unwrap();
        a.apply_local(&insert(1, "B"), "a").unwrap();

        let pending = a.encode_since(&acked).unwrap();
        b.apply_remote(&pending, "a").unwrap();
        assert_eq!(b.snapshot(), "AB");

        let sv = a.state_vector();
        assert!(a.encode_since(&sv).unwrap().is_empty());
    }

    #[test]
    fn test_state_roundtrip() {
        let mut doc = AutomergeText::genesis("persist me").unwrap();
        doc.apply_local(&insert(0, ">"), "a").unwrap();
        let loaded = AutomergeText::load(&doc.encode_state()).unwrap();
        assert_eq!(loaded.snapshot(), ">persist me");
    }

    #[test]
    fn test_observers_see_local_and_remote_changes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut a = AutomergeText::genesis("").unwrap();
        let mut b = AutomergeText::genesis("").unwrap();
        let sink = seen.clone();
        a.observe(Box::new(move |change| {
            sink.lock().unwrap().push(change.origin.clone());
        }));

        a.apply_local(&insert(0, "x"), "alice").unwrap();
        let update = b.apply_local(&insert(0, "y"), "bob").unwrap();
        a.apply_remote(&update, "bob").unwrap();
        // Duplicate delivery changes nothing and is not reported.
        a.apply_remote(&update, "bob").unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["alice", "bob"]);
    }
}
