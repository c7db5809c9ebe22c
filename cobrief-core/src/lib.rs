//! # cobrief-core — Collaboration primitives for shared content briefs
//!
//! Transport-free building blocks: the operation model, a mergeable text
//! document, the conflict resolution engine that drives it, and the
//! comment anchoring resolver that reads its content.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  apply_operation   ┌────────────────────┐
//! │ Local editor │ ─────────────────► │  ConflictEngine    │
//! └──────────────┘                    │  (metrics, queue)  │
//!                                     └─────────┬──────────┘
//! ┌──────────────┐  handle_incoming            │
//! │ Realtime hub │ ───────────────────────────►│
//! └──────────────┘                             ▼
//!                                     ┌────────────────────┐
//!                                     │ MergeableDocument  │──► snapshot
//!                                     │ (AutomergeText)    │       │
//!                                     └────────────────────┘       ▼
//!                                                        ┌──────────────────┐
//!                                                        │ resolve_position │
//!                                                        │ (comment anchors)│
//!                                                        └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — Insert / delete / retain / format operations
//! - [`collab`] — Mergeable document trait, automerge backend, undo, engine
//! - [`anchor`] — Comment anchor resolution and drift tracking
//! - [`layout`] — Pixel rectangles for resolved ranges
//! - [`clock`] — Injectable millisecond clock
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Local apply (single insert) | <100µs |
//! | resolve_position, 10KB text | <50µs |
//! | get_range_pixel_position | single pass |

pub mod anchor;
pub mod clock;
pub mod collab;
pub mod error;
pub mod layout;
pub mod operation;

pub use anchor::{
    content_version, resolve_position, AnchorResolution, AnchorState, AnchorTracker, CommentAnchor,
    DriftNotice, MatchStrategy,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collab::{
    ApplyOutcome, AutomergeText, ConflictEngine, DocumentBackend, DocumentChange,
    DocumentState, EngineConfig, EngineMetrics, InitSource, MergeableDocument,
    OfflineBackend, RemoteUpdate, StateVector, StoredDocument, SubscriptionId, UndoManager,
};
pub use error::{CollabError, Result};
pub use layout::{
    get_range_pixel_position, locate_range, MonospaceLayout, NodeOffset, Rect, TextContainer,
};
pub use operation::{
    AttrValue, FormatAttributes, Operation, OperationKind, OperationPayload, TextEdit,
};
