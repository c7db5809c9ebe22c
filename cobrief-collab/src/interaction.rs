//! Scoped interaction tokens.
//!
//! While a comment UI is being used, selection changes it causes must not
//! be treated as the user selecting text. Each such interaction holds an
//! [`InteractionToken`] from an [`InteractionContext`]; selection handlers
//! ask the context whether anything live should suppress them. Tokens
//! expire on their own, so a forgotten `end` cannot wedge selection.

use std::time::Duration;

use log::trace;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    /// Clicking into a comment popover or thread.
    CommentThread,
    /// Creating a comment from the current selection.
    CommentComposer,
    /// Acting on a drift notice.
    DriftNotice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionToken {
    id: Uuid,
    kind: InteractionKind,
    expires_at: u64,
}

impl InteractionToken {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> InteractionKind {
        self.kind
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct InteractionContext {
    ttl: Duration,
    live: Vec<InteractionToken>,
}

impl Default for InteractionContext {
    fn default() -> Self {
        Self::new(Duration::from_millis(300))
    }
}

impl InteractionContext {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            live: Vec::new(),
        }
    }

    pub fn begin(&mut self, kind: InteractionKind, now: u64) -> InteractionToken {
        let token = InteractionToken {
            id: Uuid::new_v4(),
            kind,
            expires_at: now + self.ttl.as_millis() as u64,
        };
        trace!("Interaction {:?} begins ({})", kind, token.id);
        self.live.push(token.clone());
        token
    }

    /// Release a token early. Returns `false` if it had already expired or
    /// been released.
    pub fn end(&mut self, token: &InteractionToken) -> bool {
        let before = self.live.len();
        self.live.retain(|t| t.id != token.id);
        self.live.len() != before
    }

    /// Whether a selection change at `now` comes from a live interaction.
    pub fn should_suppress_selection(&mut self, now: u64) -> bool {
        self.live.retain(|t| t.is_live(now));
        !self.live.is_empty()
    }

    pub fn live_count(&self, now: u64) -> usize {
        self.live.iter().filter(|t| t.is_live(now)).count()
    }
}
