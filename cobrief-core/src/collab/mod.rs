//! Mergeable document abstraction and the conflict resolution engine.
//!
//! The engine never touches a concrete CRDT: it is written against
//! [`MergeableDocument`], which [`AutomergeText`] implements on top of
//! automerge. Swapping the CRDT means providing another implementation of
//! the trait.

mod automerge_doc;
mod backend;
mod engine;
mod undo;

pub use automerge_doc::AutomergeText;
pub use backend::{DocumentBackend, OfflineBackend, StoredDocument};
pub use engine::{
    ApplyOutcome, ConflictEngine, DocumentState, EngineConfig, EngineMetrics, InitSource,
    RemoteUpdate, SubscriptionId,
};
pub use undo::UndoManager;

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::operation::{FormatAttributes, TextEdit};

/// A change applied to a mergeable document, reported to its observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    /// Encoded changes, loadable by any other replica.
    pub update: Vec<u8>,
    /// Tag of the transaction that produced the change.
    pub origin: String,
}

pub type ChangeObserver = Box<dyn Fn(&DocumentChange) + Send + Sync>;

/// Opaque summary of which changes a replica has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(pub Vec<Vec<u8>>);

/// A text document whose concurrent edits merge deterministically.
pub trait MergeableDocument: Send + Sized {
    /// Stable position that survives concurrent edits.
    type Anchor: Clone + Debug + Send + Sync;

    /// Create a replica seeded with `content`. Replicas seeded with the same
    /// content share their initial history and merge cleanly.
    fn genesis(content: &str) -> Result<Self>;

    /// Restore a replica from [`MergeableDocument::encode_state`] output.
    fn load(state: &[u8]) -> Result<Self>;

    /// Identifier of this replica.
    fn client_id(&self) -> String;

    /// Apply a local edit in a transaction tagged with `origin` and return
    /// the encoded change.
    fn apply_local(&mut self, edit: &TextEdit, origin: &str) -> Result<Vec<u8>>;

    /// Merge changes produced by another replica.
    fn apply_remote(&mut self, update: &[u8], origin: &str) -> Result<()>;

    fn snapshot(&self) -> String;

    /// Length in characters.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Formatting attributes in effect at `position`.
    fn attributes_at(&self, position: usize) -> FormatAttributes;

    /// Anchor to the character at `position`, or to the end of the text when
    /// `position == len()`.
    fn anchor_at(&self, position: usize) -> Result<Self::Anchor>;

    /// Current position of an anchor, `None` if it can no longer be placed.
    fn resolve_anchor(&self, anchor: &Self::Anchor) -> Option<usize>;

    fn state_vector(&mut self) -> StateVector;

    /// Every change not covered by `since`.
    fn encode_since(&mut self, since: &StateVector) -> Result<Vec<u8>>;

    /// Full state, loadable with [`MergeableDocument::load`].
    fn encode_state(&mut self) -> Vec<u8>;

    /// Register an observer called after every applied change.
    fn observe(&mut self, observer: ChangeObserver);
}
