//! Comment anchoring.
//!
//! A comment stores the offsets and the verbatim snippet it was made on.
//! [`resolve_position`] maps that record onto the current flattened text,
//! trying progressively looser matches. It is total: every input yields a
//! range inside the text or [`AnchorResolution::Drifted`].
//!
//! ```text
//! bounds ──► in place ──► exact ──► whitespace-normalized ──► partial prefix
//!   │            │           │                 │                    │
//!   └─ drifted   └───────────┴──── resolved ───┴────────────────────┘
//! ```
//!
//! Offsets count Unicode scalar values.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{CollabError, Result};

/// Snippets longer than this may be matched by their prefix.
pub const PARTIAL_MATCH_THRESHOLD: usize = 50;
/// Characters of the snippet used to locate a partial match.
pub const PARTIAL_PREFIX_LEN: usize = 30;

// ─── Resolution ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Text still sits at the stored offsets.
    InPlace,
    Exact,
    Normalized,
    PartialPrefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorResolution {
    Resolved {
        start: usize,
        end: usize,
        strategy: MatchStrategy,
    },
    Drifted,
}

impl AnchorResolution {
    pub fn range(&self) -> Option<(usize, usize)> {
        match *self {
            AnchorResolution::Resolved { start, end, .. } => Some((start, end)),
            AnchorResolution::Drifted => None,
        }
    }

    pub fn is_drifted(&self) -> bool {
        matches!(self, AnchorResolution::Drifted)
    }

    pub fn into_result(self) -> Result<(usize, usize)> {
        self.range().ok_or(CollabError::ContentDrift)
    }
}

/// Map a stored comment range onto `current_text`.
///
/// First occurrence wins for every search. No best-guess position is ever
/// returned: if nothing matches, the result is `Drifted`.
pub fn resolve_position(
    stored_start: i64,
    stored_end: i64,
    stored_text: &str,
    current_text: &str,
) -> AnchorResolution {
    let text_len = current_text.chars().count();
    if stored_start < 0 || stored_end < stored_start || stored_end as u64 > text_len as u64 {
        return AnchorResolution::Drifted;
    }
    if stored_text.is_empty() {
        return AnchorResolution::Drifted;
    }

    let snippet_len = stored_text.chars().count();
    let (start, end) = (stored_start as usize, stored_end as usize);

    if end - start == snippet_len && char_slice(current_text, start, end) == Some(stored_text) {
        return resolved(start, end, MatchStrategy::InPlace);
    }

    if let Some(byte) = current_text.find(stored_text) {
        let start = char_index(current_text, byte);
        return resolved(start, start + snippet_len, MatchStrategy::Exact);
    }

    if let Some((start, end)) = normalized_match(stored_text, current_text) {
        return resolved(start, end, MatchStrategy::Normalized);
    }

    if snippet_len > PARTIAL_MATCH_THRESHOLD {
        if let Some(start) = partial_prefix_match(stored_text, snippet_len, current_text) {
            return resolved(start, start + snippet_len, MatchStrategy::PartialPrefix);
        }
    }

    AnchorResolution::Drifted
}

fn resolved(start: usize, end: usize, strategy: MatchStrategy) -> AnchorResolution {
    AnchorResolution::Resolved {
        start,
        end,
        strategy,
    }
}

/// Char index of a byte offset known to lie on a char boundary.
fn char_index(text: &str, byte: usize) -> usize {
    text[..byte].chars().count()
}

/// Substring by char range, `None` if out of bounds.
fn char_slice(text: &str, start: usize, end: usize) -> Option<&str> {
    let mut indices = text.char_indices().map(|(i, _)| i).chain(std::iter::once(text.len()));
    let from = indices.nth(start)?;
    let to = if end == start {
        from
    } else {
        indices.nth(end - start - 1)?
    };
    text.get(from..to)
}

/// Collapse every whitespace run to one space.
pub fn normalize_whitespace(text: &str) -> String {
    collapse(text).0
}

/// Collapsed text plus, per collapsed char, the original char range it came
/// from.
fn collapse(text: &str) -> (String, Vec<(usize, usize)>) {
    let mut out = String::with_capacity(text.len());
    let mut spans: Vec<(usize, usize)> = Vec::with_capacity(text.len());
    let mut in_space = false;
    for (i, c) in text.chars().enumerate() {
        if c.is_whitespace() {
            if in_space {
                if let Some(last) = spans.last_mut() {
                    last.1 = i + 1;
                }
                continue;
            }
            in_space = true;
            out.push(' ');
        } else {
            in_space = false;
            out.push(c);
        }
        spans.push((i, i + 1));
    }
    (out, spans)
}

fn normalized_match(stored_text: &str, current_text: &str) -> Option<(usize, usize)> {
    let needle = normalize_whitespace(stored_text);
    let (haystack, spans) = collapse(current_text);
    let byte = haystack.find(&needle)?;
    let first = char_index(&haystack, byte);
    let last = first + needle.chars().count() - 1;
    Some((spans.get(first)?.0, spans.get(last)?.1))
}

fn partial_prefix_match(stored_text: &str, snippet_len: usize, current_text: &str) -> Option<usize> {
    let prefix: String = stored_text.chars().take(PARTIAL_PREFIX_LEN).collect();
    let expected = normalize_whitespace(stored_text);
    let expected = expected.trim();

    for (byte, _) in current_text.match_indices(prefix.as_str()) {
        let start = char_index(current_text, byte);
        let Some(candidate) = char_slice(current_text, start, start + snippet_len) else {
            continue;
        };
        if normalize_whitespace(candidate).trim() == expected {
            return Some(start);
        }
    }
    None
}

// ─── Anchors and tracking ────────────────────────────────────────

/// Persisted anchor of a comment. Never rewritten by resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentAnchor {
    pub comment_id: String,
    pub stored_start: i64,
    pub stored_end: i64,
    pub stored_text: String,
}

impl CommentAnchor {
    pub fn new(comment_id: &str, start: i64, end: i64, text: &str) -> Self {
        Self {
            comment_id: comment_id.to_string(),
            stored_start: start,
            stored_end: end,
            stored_text: text.to_string(),
        }
    }

    pub fn resolve(&self, current_text: &str) -> AnchorResolution {
        resolve_position(
            self.stored_start,
            self.stored_end,
            &self.stored_text,
            current_text,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorState {
    Unresolved,
    Resolving,
    Resolved { start: usize, end: usize },
    Drifted,
}

/// Informational notice for a drifted anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftNotice {
    pub comment_id: String,
    pub stored_text: String,
    pub dismissed: bool,
}

impl DriftNotice {
    pub fn message(&self) -> String {
        format!(
            "The text this comment referred to (\"{}\") has changed",
            self.stored_text
        )
    }
}

/// Version key for a content snapshot.
pub fn content_version(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Resolution state of one comment anchor across renders.
///
/// Results are cached per content version; a drifted anchor stays drifted
/// until the content changes, then resolution starts over.
#[derive(Debug, Clone)]
pub struct AnchorTracker {
    anchor: CommentAnchor,
    state: AnchorState,
    version: Option<u64>,
    notice: Option<DriftNotice>,
}

impl AnchorTracker {
    pub fn new(anchor: CommentAnchor) -> Self {
        Self {
            anchor,
            state: AnchorState::Unresolved,
            version: None,
            notice: None,
        }
    }

    pub fn anchor(&self) -> &CommentAnchor {
        &self.anchor
    }

    pub fn state(&self) -> AnchorState {
        self.state
    }

    /// Whether content at `version` still has to be resolved.
    pub fn needs_refresh(&self, version: u64) -> bool {
        let settled = matches!(
            self.state,
            AnchorState::Resolved { .. } | AnchorState::Drifted
        );
        !(settled && self.version == Some(version))
    }

    /// Mark resolution of `version` as started.
    pub fn begin(&mut self, version: u64) {
        self.version = Some(version);
        self.state = AnchorState::Resolving;
    }

    /// Record the outcome of the resolution started by [`Self::begin`].
    pub fn complete(&mut self, resolution: AnchorResolution) -> AnchorState {
        self.state = match resolution {
            AnchorResolution::Resolved { start, end, .. } => {
                self.notice = None;
                AnchorState::Resolved { start, end }
            }
            AnchorResolution::Drifted => {
                debug!("Anchor for comment {} drifted", self.anchor.comment_id);
                if self.notice.is_none() {
                    self.notice = Some(DriftNotice {
                        comment_id: self.anchor.comment_id.clone(),
                        stored_text: self.anchor.stored_text.clone(),
                        dismissed: false,
                    });
                }
                AnchorState::Drifted
            }
        };
        self.state
    }

    /// Resolve against `current_text` unless `version` was already resolved.
    pub fn refresh(&mut self, current_text: &str, version: u64) -> AnchorState {
        if !self.needs_refresh(version) {
            return self.state;
        }
        self.begin(version);
        let resolution = self.anchor.resolve(current_text);
        self.complete(resolution)
    }

    /// Forget the cached result; the next refresh resolves again.
    pub fn invalidate(&mut self) {
        self.state = AnchorState::Unresolved;
        self.version = None;
    }

    /// Refresh keyed by a hash of the text.
    pub fn refresh_text(&mut self, current_text: &str) -> AnchorState {
        self.refresh(current_text, content_version(current_text))
    }

    /// Notice to show, if drifted and not dismissed.
    pub fn drift_notice(&self) -> Option<&DriftNotice> {
        self.notice.as_ref().filter(|n| !n.dismissed)
    }

    pub fn dismiss_notice(&mut self) {
        if let Some(notice) = self.notice.as_mut() {
            notice.dismissed = true;
        }
    }
}
