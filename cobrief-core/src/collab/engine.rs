//! Conflict resolution engine.
//!
//! Owns the single mergeable document of an open brief. Every mutation goes
//! through [`ConflictEngine::apply_operation`] (local) or
//! [`ConflictEngine::handle_incoming_operation`] (remote) so metrics,
//! undo history and publishing stay consistent.
//!
//! ```text
//!  apply_operation ──► tagged txn ──► UndoManager ──► publish (all unsent changes)
//!                                          │
//!  handle_incoming ──► FIFO ──► merge ─────┴──► observer ──► conflicts_resolved
//!                                                        └──► remote subscribers
//! ```
//!
//! A failed publish leaves the change unacknowledged; the next publish
//! carries it again, so no retry queue is kept.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::backend::{lock, DocumentBackend, StoredDocument};
use super::undo::UndoManager;
use super::{AutomergeText, DocumentChange, MergeableDocument, StateVector};
use crate::clock::{Clock, SystemClock};
use crate::error::{CollabError, Result};
use crate::operation::{Operation, TextEdit};

// ─── Public types ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local edits closer together than this undo as one step.
    pub undo_capture_timeout_ms: u64,
    /// Save a full checkpoint after this many local operations. 0 disables.
    pub checkpoint_every: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            undo_capture_timeout_ms: 500,
            checkpoint_every: 200,
        }
    }
}

impl EngineConfig {
    pub fn for_testing() -> Self {
        Self {
            undo_capture_timeout_ms: 0,
            checkpoint_every: 0,
        }
    }
}

/// Where the opened document's initial state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitSource {
    /// Full CRDT checkpoint.
    Snapshot,
    /// Flattened content, seeded into a fresh structure.
    Content,
    /// Nothing stored, or the load failed.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied locally and published.
    Synced,
    /// Applied locally; publishing failed and will ride on the next publish.
    PendingSync,
    /// Not applied.
    Rejected,
}

impl ApplyOutcome {
    pub fn is_applied(self) -> bool {
        !matches!(self, ApplyOutcome::Rejected)
    }
}

/// A merged change that did not originate from the local participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUpdate {
    pub update: Vec<u8>,
    pub origin: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentState {
    pub content: String,
    /// Client id of the local replica.
    pub version: String,
    pub last_modified: u64,
    pub participants: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineMetrics {
    pub conflicts_resolved: u64,
    pub operations_applied: u64,
    pub average_resolution_time: Duration,
    pub participant_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type AppliedCallback = Arc<dyn Fn(&Operation) + Send + Sync>;
type RemoteCallback = Arc<dyn Fn(&RemoteUpdate) + Send + Sync>;

// ─── Internal state ──────────────────────────────────────────────

struct OpenDocument<D: MergeableDocument> {
    id: String,
    doc: D,
    undo: UndoManager<D::Anchor>,
    /// Changes up to here have been published successfully.
    acked: StateVector,
    participants: BTreeSet<String>,
    last_modified: u64,
    incoming: VecDeque<Operation>,
    seen: SeenOperations,
}

/// Most recent operation ids merged into the open document.
struct SeenOperations {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    capacity: usize,
}

impl SeenOperations {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`. `false` when it was already recorded.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }
}

const SEEN_OPERATIONS: usize = 4096;

/// State the document observer writes to.
struct ObserverShared {
    local_participant: String,
    conflicts_resolved: AtomicU64,
    outbox: Mutex<Vec<DocumentChange>>,
}

struct Staged {
    document_id: String,
    operation: Operation,
    marker: StateVector,
}

// ─── Engine ──────────────────────────────────────────────────────

pub struct ConflictEngine<B, D: MergeableDocument = AutomergeText> {
    participant_id: String,
    backend: Arc<B>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    state: Mutex<Option<OpenDocument<D>>>,
    shared: Arc<ObserverShared>,
    operations_applied: AtomicU64,
    /// Running mean latency in microseconds, stored as f64 bits.
    average_micros: AtomicU64,
    applied_subscribers: Mutex<Vec<(SubscriptionId, AppliedCallback)>>,
    remote_subscribers: Mutex<Vec<(SubscriptionId, RemoteCallback)>>,
    next_subscription: AtomicU64,
}

impl<B: DocumentBackend> ConflictEngine<B> {
    pub fn new(participant_id: &str, backend: Arc<B>) -> Self {
        Self::with_config(participant_id, backend, EngineConfig::default())
    }
}

impl<B: DocumentBackend, D: MergeableDocument> ConflictEngine<B, D> {
    pub fn with_config(participant_id: &str, backend: Arc<B>, config: EngineConfig) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            backend,
            clock: Arc::new(SystemClock),
            config,
            state: Mutex::new(None),
            shared: Arc::new(ObserverShared {
                local_participant: participant_id.to_string(),
                conflicts_resolved: AtomicU64::new(0),
                outbox: Mutex::new(Vec::new()),
            }),
            operations_applied: AtomicU64::new(0),
            average_micros: AtomicU64::new(0f64.to_bits()),
            applied_subscribers: Mutex::new(Vec::new()),
            remote_subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn document_id(&self) -> Option<String> {
        lock(&self.state).as_ref().map(|open| open.id.clone())
    }

    // ── Lifecycle ──

    /// Open `document_id`, seeding the mergeable structure from storage.
    ///
    /// A failed or empty load opens an empty document instead of failing.
    pub async fn initialize_document(&self, document_id: &str) -> Result<InitSource> {
        let loaded = self.backend.load_document(document_id).await;
        let (mut doc, source) = match loaded {
            Ok(Some(stored)) => Self::seed(document_id, stored)?,
            Ok(None) => (D::genesis("")?, InitSource::Empty),
            Err(e) => {
                warn!("Failed to load document {}, starting empty: {}", document_id, e);
                (D::genesis("")?, InitSource::Empty)
            }
        };

        let shared = self.shared.clone();
        doc.observe(Box::new(move |change| {
            if change.origin != shared.local_participant {
                shared.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
                lock(&shared.outbox).push(change.clone());
            }
        }));

        let open = OpenDocument {
            id: document_id.to_string(),
            acked: doc.state_vector(),
            doc,
            undo: UndoManager::new(self.config.undo_capture_timeout_ms),
            participants: BTreeSet::new(),
            last_modified: self.clock.now_millis(),
            incoming: VecDeque::new(),
            seen: SeenOperations::new(SEEN_OPERATIONS),
        };
        *lock(&self.state) = Some(open);
        info!("Opened document {} ({:?})", document_id, source);
        Ok(source)
    }

    fn seed(document_id: &str, stored: StoredDocument) -> Result<(D, InitSource)> {
        if let Some(state) = stored.crdt_state.as_deref() {
            match D::load(state) {
                Ok(doc) => return Ok((doc, InitSource::Snapshot)),
                Err(e) => warn!(
                    "Checkpoint for {} unreadable, seeding from content: {}",
                    document_id, e
                ),
            }
        }
        Ok((D::genesis(&stored.content)?, InitSource::Content))
    }

    // ── Local operations ──

    /// Apply a local operation and publish it.
    ///
    /// The transaction is tagged with the operation's participant. A failed
    /// publish does not roll the local change back.
    pub async fn apply_operation(&self, mut operation: Operation) -> ApplyOutcome {
        let started = Instant::now();
        let now = self.clock.now_millis();
        let edit = match operation.edit() {
            Ok(edit) => edit,
            Err(e) => {
                warn!("Rejected operation {}: {}", operation.id, e);
                return ApplyOutcome::Rejected;
            }
        };

        let staged = {
            let mut guard = lock(&self.state);
            let Some(open) = guard.as_mut() else {
                warn!("Rejected operation {}: {}", operation.id, CollabError::DocumentNotOpen);
                return ApplyOutcome::Rejected;
            };
            if operation.document_id != open.id {
                warn!(
                    "Rejected operation {} for {}, open document is {}",
                    operation.id, operation.document_id, open.id
                );
                return ApplyOutcome::Rejected;
            }

            let origin = operation.participant_id.clone();
            let result = if origin == self.participant_id {
                open.undo.apply_tracked(&mut open.doc, &edit, &origin, now)
            } else {
                open.doc.apply_local(&edit, &origin)
            };
            if let Err(e) = result {
                warn!("Rejected operation {}: {}", operation.id, e);
                return ApplyOutcome::Rejected;
            }

            open.participants.insert(origin);
            open.seen.insert(operation.id);
            open.last_modified = now;
            if operation.timestamp == 0 {
                operation.timestamp = now;
            }
            operation.origin_client_id = open.doc.client_id();
            Self::stage(open, operation)
        };

        self.record_latency(started.elapsed());
        self.notify_applied(&staged.operation);
        self.flush_remote();

        let outcome = self.publish(staged).await;
        self.maybe_checkpoint().await;
        outcome
    }

    /// Attach every unpublished change to `operation`.
    fn stage(open: &mut OpenDocument<D>, mut operation: Operation) -> Staged {
        let marker = open.doc.state_vector();
        match open.doc.encode_since(&open.acked) {
            Ok(update) => operation.update = Some(update),
            Err(e) => warn!("Could not encode pending changes: {}", e),
        }
        Staged {
            document_id: open.id.clone(),
            operation,
            marker,
        }
    }

    async fn publish(&self, staged: Staged) -> ApplyOutcome {
        let Staged {
            document_id,
            operation,
            marker,
        } = staged;
        let id = operation.id;
        match self.backend.publish_operation(operation).await {
            Ok(()) => {
                if let Some(open) = lock(&self.state).as_mut() {
                    if open.id == document_id {
                        open.acked = marker;
                    }
                }
                ApplyOutcome::Synced
            }
            Err(e) => {
                warn!("Publishing operation {} failed, will resend with the next one: {}", id, e);
                ApplyOutcome::PendingSync
            }
        }
    }

    async fn maybe_checkpoint(&self) {
        let every = self.config.checkpoint_every;
        if every == 0 || self.operations_applied.load(Ordering::Relaxed) % every != 0 {
            return;
        }
        if let Err(e) = self.checkpoint().await {
            warn!("Checkpoint failed: {}", e);
        }
    }

    fn record_latency(&self, elapsed: Duration) {
        let n = self.operations_applied.fetch_add(1, Ordering::Relaxed) + 1;
        let sample = elapsed.as_secs_f64() * 1_000_000.0;
        let previous = f64::from_bits(self.average_micros.load(Ordering::Relaxed));
        let mean = previous + (sample - previous) / n as f64;
        self.average_micros.store(mean.to_bits(), Ordering::Relaxed);
    }

    // ── Remote operations ──

    /// Queue an operation from another participant and drain the queue.
    ///
    /// Operations for a different document and echoes of this replica's own
    /// changes are skipped. Returns how many operations were applied.
    pub fn handle_incoming_operation(&self, operation: Operation) -> usize {
        let now = self.clock.now_millis();
        let mut applied = 0;
        {
            let mut guard = lock(&self.state);
            let Some(open) = guard.as_mut() else {
                debug!("Ignoring operation {}: no document open", operation.id);
                return 0;
            };
            if operation.document_id != open.id {
                debug!(
                    "Ignoring operation {} for {}, open document is {}",
                    operation.id, operation.document_id, open.id
                );
                return 0;
            }

            open.incoming.push_back(operation);
            let client_id = open.doc.client_id();
            while let Some(next) = open.incoming.pop_front() {
                if next.origin_client_id == client_id {
                    continue;
                }
                // Positional replays are not idempotent in the CRDT.
                if !open.seen.insert(next.id) {
                    debug!("Skipping operation {}: already merged", next.id);
                    continue;
                }
                match Self::merge_incoming(open, &next) {
                    Ok(()) => {
                        applied += 1;
                        open.participants.insert(next.participant_id.clone());
                        open.last_modified = now;
                    }
                    Err(e) => warn!("Dropping incoming operation {}: {}", next.id, e),
                }
            }
        }
        self.flush_remote();
        applied
    }

    fn merge_incoming(open: &mut OpenDocument<D>, operation: &Operation) -> Result<()> {
        match &operation.update {
            Some(update) => open.doc.apply_remote(update, &operation.participant_id),
            // Log replays without CRDT changes apply positionally and are
            // published with the next local operation like any local change.
            None => {
                let edit = operation.edit()?;
                open.doc.apply_local(&edit, &operation.participant_id).map(|_| ())
            }
        }
    }

    // ── Undo / redo ──

    /// Undo the last local step. `false` when there is nothing to undo.
    pub async fn undo(&self) -> bool {
        self.history_step(false).await
    }

    /// Redo the last undone step. `false` when there is nothing to redo.
    pub async fn redo(&self) -> bool {
        self.history_step(true).await
    }

    async fn history_step(&self, redo: bool) -> bool {
        let now = self.clock.now_millis();
        let staged = {
            let mut guard = lock(&self.state);
            let Some(open) = guard.as_mut() else {
                return false;
            };
            let origin = self.participant_id.clone();
            let result = if redo {
                open.undo.redo(&mut open.doc, &origin)
            } else {
                open.undo.undo(&mut open.doc, &origin)
            };
            let edits = match result {
                Ok(Some(edits)) => edits,
                Ok(None) => return false,
                Err(e) => {
                    warn!("History step failed: {}", e);
                    return false;
                }
            };
            open.last_modified = now;
            let operation = summary_operation(&open.id, &origin, &edits)
                .with_timestamp(now)
                .with_origin_client(&open.doc.client_id());
            Self::stage(open, operation)
        };
        self.notify_applied(&staged.operation);
        self.publish(staged).await;
        true
    }

    pub fn can_undo(&self) -> bool {
        lock(&self.state).as_ref().is_some_and(|open| open.undo.can_undo())
    }

    pub fn can_redo(&self) -> bool {
        lock(&self.state).as_ref().is_some_and(|open| open.undo.can_redo())
    }

    // ── Reads ──

    pub fn get_document_state(&self) -> Result<DocumentState> {
        let guard = lock(&self.state);
        let open = guard.as_ref().ok_or(CollabError::DocumentNotOpen)?;
        Ok(DocumentState {
            content: open.doc.snapshot(),
            version: open.doc.client_id(),
            last_modified: open.last_modified,
            participants: open.participants.clone(),
        })
    }

    pub fn get_metrics(&self) -> EngineMetrics {
        let micros = f64::from_bits(self.average_micros.load(Ordering::Relaxed)).max(0.0);
        EngineMetrics {
            conflicts_resolved: self.shared.conflicts_resolved.load(Ordering::Relaxed),
            operations_applied: self.operations_applied.load(Ordering::Relaxed),
            average_resolution_time: Duration::from_secs_f64(micros / 1_000_000.0),
            participant_count: lock(&self.state)
                .as_ref()
                .map_or(0, |open| open.participants.len()),
        }
    }

    /// Persist the full CRDT state so later loads skip reseeding.
    pub async fn checkpoint(&self) -> Result<()> {
        let (document_id, stored) = {
            let mut guard = lock(&self.state);
            let open = guard.as_mut().ok_or(CollabError::DocumentNotOpen)?;
            let stored = StoredDocument {
                content: open.doc.snapshot(),
                crdt_state: Some(open.doc.encode_state()),
            };
            (open.id.clone(), stored)
        };
        self.backend.save_document(&document_id, stored).await?;
        debug!("Checkpointed {}", document_id);
        Ok(())
    }

    // ── Subscriptions ──

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_operation_applied<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Operation) + Send + Sync + 'static,
    {
        let id = self.next_id();
        lock(&self.applied_subscribers).push((id, Arc::new(callback)));
        id
    }

    pub fn on_remote_update<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&RemoteUpdate) + Send + Sync + 'static,
    {
        let id = self.next_id();
        lock(&self.remote_subscribers).push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        lock(&self.applied_subscribers).retain(|(sid, _)| {
            let keep = *sid != id;
            removed |= !keep;
            keep
        });
        lock(&self.remote_subscribers).retain(|(sid, _)| {
            let keep = *sid != id;
            removed |= !keep;
            keep
        });
        removed
    }

    fn notify_applied(&self, operation: &Operation) {
        let callbacks: Vec<AppliedCallback> = lock(&self.applied_subscribers)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(operation);
        }
    }

    /// Deliver changes collected by the observer, outside every lock.
    fn flush_remote(&self) {
        let changes = std::mem::take(&mut *lock(&self.shared.outbox));
        if changes.is_empty() {
            return;
        }
        let callbacks: Vec<RemoteCallback> = lock(&self.remote_subscribers)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        let timestamp = self.clock.now_millis();
        for change in changes {
            let update = RemoteUpdate {
                update: change.update,
                origin: change.origin,
                timestamp,
            };
            for callback in &callbacks {
                callback(&update);
            }
        }
    }
}

/// Operation describing an undo or redo step. Multi-edit steps travel as a
/// retain whose CRDT update carries the actual changes.
fn summary_operation(document_id: &str, participant_id: &str, edits: &[TextEdit]) -> Operation {
    match edits {
        [single] => Operation::from_edit(document_id, participant_id, single),
        _ => Operation::retain(document_id, participant_id, 0),
    }
}
