//! Undo/redo scoped to one mergeable document.
//!
//! Stack items are expressed in document anchors rather than raw offsets,
//! so remote edits merged between an edit and its undo do not shift the
//! undo onto the wrong text. Consecutive local edits within the capture
//! timeout collapse into one undo step.

use super::MergeableDocument;
use crate::error::Result;
use crate::operation::{AttrValue, FormatAttributes, TextEdit};

#[derive(Debug, Clone)]
enum UndoItem<A> {
    /// Remove the characters from `first` to `last` inclusive.
    Remove { first: A, last: A },
    /// Re-insert `text` before `at`.
    Restore { at: A, text: String },
    /// Re-apply `attributes` over `first..=last`.
    Reformat {
        first: A,
        last: A,
        attributes: FormatAttributes,
    },
}

#[derive(Debug, Clone)]
struct UndoEntry<A> {
    items: Vec<UndoItem<A>>,
}

/// Applies `edit` to `doc` and returns the encoded change together with the
/// items that revert it.
fn apply_with_inverse<D: MergeableDocument>(
    doc: &mut D,
    edit: &TextEdit,
    origin: &str,
) -> Result<(Vec<u8>, Vec<UndoItem<D::Anchor>>)> {
    edit.check_bounds(doc.len())?;
    match edit {
        TextEdit::Insert { position, text } => {
            let update = doc.apply_local(edit, origin)?;
            let count = text.chars().count();
            if count == 0 {
                return Ok((update, Vec::new()));
            }
            let item = UndoItem::Remove {
                first: doc.anchor_at(*position)?,
                last: doc.anchor_at(position + count - 1)?,
            };
            Ok((update, vec![item]))
        }
        TextEdit::Delete { position, length } => {
            let removed: String = doc.snapshot().chars().skip(*position).take(*length).collect();
            let update = doc.apply_local(edit, origin)?;
            let item = UndoItem::Restore {
                at: doc.anchor_at(*position)?,
                text: removed,
            };
            Ok((update, vec![item]))
        }
        TextEdit::Format {
            position,
            length,
            attributes,
        } => {
            let prior: Vec<FormatAttributes> = (*position..position + length)
                .map(|at| prior_values(attributes, &doc.attributes_at(at)))
                .collect();
            let update = doc.apply_local(edit, origin)?;

            // One item per run of characters that shared the same prior values.
            let mut items = Vec::new();
            let mut run = 0;
            while run < prior.len() {
                let mut last = run;
                while last + 1 < prior.len() && prior[last + 1] == prior[run] {
                    last += 1;
                }
                items.push(UndoItem::Reformat {
                    first: doc.anchor_at(position + run)?,
                    last: doc.anchor_at(position + last)?,
                    attributes: prior[run].clone(),
                });
                run = last + 1;
            }
            Ok((update, items))
        }
        TextEdit::Retain => Ok((Vec::new(), Vec::new())),
    }
}

/// Values the keys of `applied` had before, `Null` where a key was unset.
fn prior_values(applied: &FormatAttributes, before: &FormatAttributes) -> FormatAttributes {
    applied
        .keys()
        .map(|key| {
            let value = before.get(key).cloned().unwrap_or(AttrValue::Null);
            (key.clone(), value)
        })
        .collect()
}

/// Translate an item back into a positional edit against the current text.
/// `None` when the text it referred to is gone.
fn item_edit<D: MergeableDocument>(doc: &D, item: &UndoItem<D::Anchor>) -> Option<TextEdit> {
    match item {
        UndoItem::Remove { first, last } => {
            let start = doc.resolve_anchor(first)?;
            let end = doc.resolve_anchor(last)?;
            (end >= start && end < doc.len()).then(|| TextEdit::Delete {
                position: start,
                length: end - start + 1,
            })
        }
        UndoItem::Restore { at, text } => {
            let position = doc.resolve_anchor(at)?.min(doc.len());
            Some(TextEdit::Insert {
                position,
                text: text.clone(),
            })
        }
        UndoItem::Reformat {
            first,
            last,
            attributes,
        } => {
            let start = doc.resolve_anchor(first)?;
            let end = doc.resolve_anchor(last)?;
            (end >= start && end < doc.len()).then(|| TextEdit::Format {
                position: start,
                length: end - start + 1,
                attributes: attributes.clone(),
            })
        }
    }
}

/// Two-stack undo manager.
pub struct UndoManager<A> {
    undo_stack: Vec<UndoEntry<A>>,
    redo_stack: Vec<UndoEntry<A>>,
    capture_timeout_ms: u64,
    last_capture: Option<u64>,
}

impl<A: Clone> UndoManager<A> {
    pub fn new(capture_timeout_ms: u64) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            capture_timeout_ms,
            last_capture: None,
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    /// Close the current group; the next capture starts a new undo step.
    pub fn stop_capturing(&mut self) {
        self.last_capture = None;
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.last_capture = None;
    }

    fn capture(&mut self, items: Vec<UndoItem<A>>, now_ms: u64) {
        if items.is_empty() {
            return;
        }
        let merge = matches!(
            self.last_capture,
            Some(last) if now_ms.saturating_sub(last) <= self.capture_timeout_ms
        );
        match self.undo_stack.last_mut() {
            Some(entry) if merge => entry.items.extend(items),
            _ => self.undo_stack.push(UndoEntry { items }),
        }
        self.last_capture = Some(now_ms);
        self.redo_stack.clear();
    }
}

impl<A: Clone> UndoManager<A> {
    /// Apply a tracked local edit and record how to revert it.
    pub fn apply_tracked<D>(
        &mut self,
        doc: &mut D,
        edit: &TextEdit,
        origin: &str,
        now_ms: u64,
    ) -> Result<Vec<u8>>
    where
        D: MergeableDocument<Anchor = A>,
    {
        let (update, items) = apply_with_inverse(doc, edit, origin)?;
        self.capture(items, now_ms);
        Ok(update)
    }

    /// Revert the most recent step. Returns the edits applied, or `None`
    /// when there is nothing to undo.
    pub fn undo<D>(&mut self, doc: &mut D, origin: &str) -> Result<Option<Vec<TextEdit>>>
    where
        D: MergeableDocument<Anchor = A>,
    {
        let Some(entry) = self.undo_stack.pop() else {
            return Ok(None);
        };
        let (edits, inverse) = replay(doc, entry, origin)?;
        self.redo_stack.push(inverse);
        self.last_capture = None;
        Ok(Some(edits))
    }

    /// Re-apply the most recently undone step.
    pub fn redo<D>(&mut self, doc: &mut D, origin: &str) -> Result<Option<Vec<TextEdit>>>
    where
        D: MergeableDocument<Anchor = A>,
    {
        let Some(entry) = self.redo_stack.pop() else {
            return Ok(None);
        };
        let (edits, inverse) = replay(doc, entry, origin)?;
        self.undo_stack.push(inverse);
        self.last_capture = None;
        Ok(Some(edits))
    }
}

/// Apply an entry's items newest first, collecting the entry that reverts it.
fn replay<D: MergeableDocument>(
    doc: &mut D,
    entry: UndoEntry<D::Anchor>,
    origin: &str,
) -> Result<(Vec<TextEdit>, UndoEntry<D::Anchor>)> {
    let mut edits = Vec::with_capacity(entry.items.len());
    let mut inverse = Vec::with_capacity(entry.items.len());
    for item in entry.items.iter().rev() {
        let Some(edit) = item_edit(doc, item) else {
            continue;
        };
        let (_, reverted) = apply_with_inverse(doc, &edit, origin)?;
        inverse.extend(reverted);
        edits.push(edit);
    }
    // Replay walks items newest first, so the collected inverses are already
    // in the order a later replay needs.
    Ok((edits, UndoEntry { items: inverse }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::AutomergeText;
    use automerge::Cursor;

    const LOCAL: &str = "alice";

    fn insert(position: usize, text: &str) -> TextEdit {
        TextEdit::Insert {
            position,
            text: text.to_string(),
        }
    }

    fn manager() -> UndoManager<Cursor> {
        UndoManager::new(500)
    }

    #[test]
    fn test_undo_insert_and_redo() {
        let mut doc = AutomergeText::genesis("world").unwrap();
        let mut undo = manager();
        undo.apply_tracked(&mut doc, &insert(0, "hello "), LOCAL, 0).unwrap();
        assert_eq!(doc.snapshot(), "hello world");

        assert!(undo.undo(&mut doc, LOCAL).unwrap().is_some());
        assert_eq!(doc.snapshot(), "world");
        assert!(undo.can_redo());

        assert!(undo.redo(&mut doc, LOCAL).unwrap().is_some());
        assert_eq!(doc.snapshot(), "hello world");
        assert!(undo.can_undo());
    }

    #[test]
    fn test_empty_stacks_are_noops() {
        let mut doc = AutomergeText::genesis("x").unwrap();
        let mut undo = manager();
        assert!(undo.undo(&mut doc, LOCAL).unwrap().is_none());
        assert!(undo.redo(&mut doc, LOCAL).unwrap().is_none());
        assert_eq!(doc.snapshot(), "x");
    }

    #[test]
    fn test_undo_delete_restores_text() {
        let mut doc = AutomergeText::genesis("Hello brave world").unwrap();
        let mut undo = manager();
        undo.apply_tracked(
            &mut doc,
            &TextEdit::Delete {
                position: 5,
                length: 6,
            },
            LOCAL,
            0,
        )
        .unwrap();
        assert_eq!(doc.snapshot(), "Hello world");
        undo.undo(&mut doc, LOCAL).unwrap();
        assert_eq!(doc.snapshot(), "Hello brave world");
    }

    #[test]
    fn test_delete_at_end_restores_at_end() {
        let mut doc = AutomergeText::genesis("abc").unwrap();
        let mut undo = manager();
        undo.apply_tracked(
            &mut doc,
            &TextEdit::Delete {
                position: 2,
                length: 1,
            },
            LOCAL,
            0,
        )
        .unwrap();
        undo.undo(&mut doc, LOCAL).unwrap();
        assert_eq!(doc.snapshot(), "abc");
    }

    #[test]
    fn test_edits_within_timeout_group_together() {
        let mut doc = AutomergeText::genesis("").unwrap();
        let mut undo = manager();
        undo.apply_tracked(&mut doc, &insert(0, "a"), LOCAL, 0).unwrap();
        undo.apply_tracked(&mut doc, &insert(1, "b"), LOCAL, 200).unwrap();
        undo.apply_tracked(&mut doc, &insert(2, "c"), LOCAL, 2_000).unwrap();
        assert_eq!(undo.undo_depth(), 2);

        undo.undo(&mut doc, LOCAL).unwrap();
        assert_eq!(doc.snapshot(), "ab");
        undo.undo(&mut doc, LOCAL).unwrap();
        assert_eq!(doc.snapshot(), "");

        undo.redo(&mut doc, LOCAL).unwrap();
        assert_eq!(doc.snapshot(), "ab");
        undo.redo(&mut doc, LOCAL).unwrap();
        assert_eq!(doc.snapshot(), "abc");
    }

    #[test]
    fn test_new_edit_clears_redo() {
        let mut doc = AutomergeText::genesis("").unwrap();
        let mut undo = manager();
        undo.apply_tracked(&mut doc, &insert(0, "a"), LOCAL, 0).unwrap();
        undo.undo(&mut doc, LOCAL).unwrap();
        assert!(undo.can_redo());
        undo.apply_tracked(&mut doc, &insert(0, "z"), LOCAL, 5_000).unwrap();
        assert!(!undo.can_redo());
    }

    #[test]
    fn test_undo_survives_remote_insert_before_edit() {
        let mut doc = AutomergeText::genesis("world").unwrap();
        let mut remote = doc.fork().unwrap();
        let mut undo = manager();

        undo.apply_tracked(&mut doc, &insert(5, "!"), LOCAL, 0).unwrap();
        let update = remote.apply_local(&insert(0, "hello "), "bob").unwrap();
        doc.apply_remote(&update, "bob").unwrap();
        assert_eq!(doc.snapshot(), "hello world!");

        undo.undo(&mut doc, LOCAL).unwrap();
        assert_eq!(doc.snapshot(), "hello world");
    }

    #[test]
    fn test_undo_format_restores_prior_attributes() {
        let mut doc = AutomergeText::genesis("styled").unwrap();
        let mut undo = manager();
        let mut attrs = FormatAttributes::new();
        attrs.insert("italic".into(), AttrValue::Bool(true));
        undo.apply_tracked(
            &mut doc,
            &TextEdit::Format {
                position: 0,
                length: 6,
                attributes: attrs,
            },
            LOCAL,
            0,
        )
        .unwrap();
        assert_eq!(doc.attributes_at(2).get("italic"), Some(&AttrValue::Bool(true)));

        undo.undo(&mut doc, LOCAL).unwrap();
        assert!(doc.attributes_at(2).get("italic").is_none());

        undo.redo(&mut doc, LOCAL).unwrap();
        assert_eq!(doc.attributes_at(2).get("italic"), Some(&AttrValue::Bool(true)));
    }

    #[test]
    fn test_undo_format_keeps_mixed_prior_formatting() {
        let mut doc = AutomergeText::genesis("plain text").unwrap();
        let mut undo = manager();
        let mut bold = FormatAttributes::new();
        bold.insert("bold".into(), AttrValue::Bool(true));
        // "plain" is bold before the tracked edit, " text" is not.
        doc.apply_local(
            &TextEdit::Format {
                position: 0,
                length: 5,
                attributes: bold.clone(),
            },
            "bob",
        )
        .unwrap();

        undo.apply_tracked(
            &mut doc,
            &TextEdit::Format {
                position: 0,
                length: 10,
                attributes: bold,
            },
            LOCAL,
            0,
        )
        .unwrap();
        assert_eq!(doc.attributes_at(7).get("bold"), Some(&AttrValue::Bool(true)));

        undo.undo(&mut doc, LOCAL).unwrap();
        assert_eq!(doc.attributes_at(2).get("bold"), Some(&AttrValue::Bool(true)));
        assert!(doc.attributes_at(7).get("bold").is_none());

        undo.redo(&mut doc, LOCAL).unwrap();
        assert_eq!(doc.attributes_at(7).get("bold"), Some(&AttrValue::Bool(true)));
    }
}
