//! In-process realtime backend.
//!
//! Stands in for the hosted database + realtime channel that clients talk
//! to: a presence table keyed by (document, participant), a content table,
//! an append-only operations log, and change notifications fanned out per
//! document through [`RoomManager`].
//!
//! ```text
//!  ConflictEngine ──publish_operation──►┌──────────────┐
//!                                       │ RealtimeHub  │──► DocumentStore
//!  PresenceService ──upsert_presence───►│  (authority) │    (optional)
//!                                       └──────┬───────┘
//!                                              │ RealtimeEvent (bincode)
//!                                              ▼
//!                                       ┌──────────────┐
//!                                       │ RoomManager  │──► every subscriber
//!                                       └──────────────┘
//! ```
//!
//! The hub keeps its own replica of every document and merges each
//! published operation's CRDT changes into it, so late joiners load the
//! full merged history instead of replaying the log.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cobrief_core::{
    AutomergeText, CollabError, ConflictEngine, DocumentBackend, MergeableDocument, Operation,
    Result, StoredDocument,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastStats, EventReceiver, RoomManager};
use crate::presence::PresenceBackend;
use crate::protocol::{EventType, ParticipantPresence, ProtocolError, RealtimeEvent};
use crate::storage::{DocumentStore, StoreError};

/// Origin tag for changes merged from checkpoints.
const CHECKPOINT_ORIGIN: &str = "checkpoint";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Events buffered per subscriber before it starts skipping.
    pub channel_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

impl HubConfig {
    pub fn for_testing() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub operations_published: u64,
    pub presence_writes: u64,
    pub rejected_offline: u64,
}

#[derive(Default)]
struct AtomicHubStats {
    operations_published: AtomicU64,
    presence_writes: AtomicU64,
    rejected_offline: AtomicU64,
}

struct HubDocument {
    replica: AutomergeText,
    content: String,
    log: Vec<Operation>,
}

impl HubDocument {
    fn from_stored(stored: &StoredDocument) -> Result<Self> {
        let replica = match stored.crdt_state.as_deref() {
            Some(state) => AutomergeText::load(state)?,
            None => AutomergeText::genesis(&stored.content)?,
        };
        Ok(Self {
            content: replica.snapshot(),
            replica,
            log: Vec::new(),
        })
    }

    fn merge(&mut self, operation: &Operation) -> Result<()> {
        match &operation.update {
            Some(update) => self.replica.apply_remote(update, &operation.participant_id),
            None => {
                let edit = operation.edit()?;
                self.replica
                    .apply_local(&edit, &operation.participant_id)
                    .map(|_| ())
            }
        }
    }

    /// Refresh the content table. Returns the new content if it changed.
    fn refresh_content(&mut self) -> Option<String> {
        let content = self.replica.snapshot();
        if content == self.content {
            return None;
        }
        self.content = content.clone();
        Some(content)
    }
}

pub struct RealtimeHub {
    rooms: RoomManager,
    presence: RwLock<HashMap<String, BTreeMap<String, ParticipantPresence>>>,
    documents: RwLock<HashMap<String, Arc<Mutex<HubDocument>>>>,
    store: Option<Arc<DocumentStore>>,
    offline: AtomicBool,
    sequence: AtomicU64,
    stats: AtomicHubStats,
}

impl RealtimeHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            rooms: RoomManager::new(config.channel_capacity),
            presence: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
            store: None,
            offline: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            stats: AtomicHubStats::default(),
        }
    }

    /// Persist operations and checkpoints to `store`, and restore documents
    /// from it on first touch.
    pub fn with_store(config: HubConfig, store: Arc<DocumentStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(config)
        }
    }

    /// While offline every call fails with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        info!("Realtime hub {}", if offline { "offline" } else { "online" });
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<()> {
        if self.is_offline() {
            self.stats.rejected_offline.fetch_add(1, Ordering::Relaxed);
            return Err(CollabError::NetworkFailure("realtime hub unreachable".into()));
        }
        Ok(())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Seed a document's content. Returns `false` if it already exists.
    pub async fn create_document(&self, document_id: &str, content: &str) -> Result<bool> {
        self.check_online()?;
        if self.document(document_id).await?.is_some() {
            return Ok(false);
        }
        let mut doc = HubDocument::from_stored(&StoredDocument::from_content(content))?;
        self.persist_checkpoint(document_id, &mut doc)?;
        let (_, created) = self.insert_document(document_id, doc).await;
        if created {
            info!("Created document {} ({} chars)", document_id, content.chars().count());
        }
        Ok(created)
    }

    /// Current content table entry.
    pub async fn content(&self, document_id: &str) -> Option<String> {
        let doc = self.documents.read().await.get(document_id).cloned()?;
        let content = doc.lock().await.content.clone();
        Some(content)
    }

    /// Operations log of a document, in publish order.
    pub async fn operations(&self, document_id: &str) -> Vec<Operation> {
        let Some(doc) = self.documents.read().await.get(document_id).cloned() else {
            return Vec::new();
        };
        let log = doc.lock().await.log.clone();
        log
    }

    /// Look up a document, restoring it from the store if needed.
    async fn document(&self, document_id: &str) -> Result<Option<Arc<Mutex<HubDocument>>>> {
        if let Some(doc) = self.documents.read().await.get(document_id) {
            return Ok(Some(doc.clone()));
        }
        let Some(restored) = self.restore(document_id)? else {
            return Ok(None);
        };
        let (doc, _) = self.insert_document(document_id, restored).await;
        Ok(Some(doc))
    }

    async fn document_or_empty(&self, document_id: &str) -> Result<Arc<Mutex<HubDocument>>> {
        if let Some(doc) = self.document(document_id).await? {
            return Ok(doc);
        }
        let empty = HubDocument::from_stored(&StoredDocument::default())?;
        Ok(self.insert_document(document_id, empty).await.0)
    }

    /// Insert unless another task got there first.
    async fn insert_document(
        &self,
        document_id: &str,
        doc: HubDocument,
    ) -> (Arc<Mutex<HubDocument>>, bool) {
        let mut documents = self.documents.write().await;
        if let Some(existing) = documents.get(document_id) {
            return (existing.clone(), false);
        }
        let doc = Arc::new(Mutex::new(doc));
        documents.insert(document_id.to_string(), doc.clone());
        (doc, true)
    }

    /// Checkpoint plus every logged change after it.
    fn restore(&self, document_id: &str) -> Result<Option<HubDocument>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let snapshot = match store.load_snapshot(document_id) {
            Ok(stored) => Some(stored),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let operations = store.load_operations_since(document_id, 0)?;
        if snapshot.is_none() && operations.is_empty() {
            return Ok(None);
        }

        let mut doc = HubDocument::from_stored(&snapshot.unwrap_or_default())?;
        for (sequence, operation) in operations {
            // Positional entries are already covered by the checkpoint that
            // followed them or cannot be placed reliably.
            if operation.update.is_some() {
                if let Err(e) = doc.merge(&operation) {
                    warn!("Skipping logged operation {} of {}: {}", sequence, document_id, e);
                }
            }
            doc.log.push(operation);
        }
        doc.content = doc.replica.snapshot();
        info!(
            "Restored document {} ({} logged operations)",
            document_id,
            doc.log.len()
        );
        Ok(Some(doc))
    }

    fn persist_checkpoint(&self, document_id: &str, doc: &mut HubDocument) -> Result<()> {
        if let Some(store) = &self.store {
            let stored = StoredDocument {
                content: doc.content.clone(),
                crdt_state: Some(doc.replica.encode_state()),
            };
            store.save_snapshot(document_id, &stored)?;
        }
        Ok(())
    }

    // ─── Fan-out ──────────────────────────────────────────────────────

    /// Receive every event of `document_id` from now on.
    pub async fn subscribe(&self, document_id: &str) -> Result<EventReceiver> {
        self.check_online()?;
        Ok(self.rooms.get_or_create(document_id).await.subscribe())
    }

    async fn fan_out(&self, event: std::result::Result<RealtimeEvent, ProtocolError>) {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!("Could not encode realtime event: {}", e);
                return;
            }
        };
        let Some(room) = self.rooms.get(&event.document_id).await else {
            return;
        };
        if let Err(e) = room.broadcast(&event) {
            warn!("Broadcast of {:?} failed: {}", event.event_type, e);
        }
    }

    pub async fn room_stats(&self, document_id: &str) -> Option<BroadcastStats> {
        Some(self.rooms.get(document_id).await?.stats())
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            operations_published: self.stats.operations_published.load(Ordering::Relaxed),
            presence_writes: self.stats.presence_writes.load(Ordering::Relaxed),
            rejected_offline: self.stats.rejected_offline.load(Ordering::Relaxed),
        }
    }
}

impl DocumentBackend for RealtimeHub {
    async fn load_document(&self, document_id: &str) -> Result<Option<StoredDocument>> {
        self.check_online()?;
        let Some(doc) = self.document(document_id).await? else {
            return Ok(None);
        };
        let mut doc = doc.lock().await;
        let crdt_state = doc.replica.encode_state();
        Ok(Some(StoredDocument {
            content: doc.content.clone(),
            crdt_state: Some(crdt_state),
        }))
    }

    async fn save_document(&self, document_id: &str, document: StoredDocument) -> Result<()> {
        self.check_online()?;
        let doc = match self.document(document_id).await? {
            Some(doc) => doc,
            None => {
                let seeded = HubDocument::from_stored(&document)?;
                self.insert_document(document_id, seeded).await.0
            }
        };
        let changed = {
            let mut doc = doc.lock().await;
            if let Some(state) = document.crdt_state.as_deref() {
                doc.replica.apply_remote(state, CHECKPOINT_ORIGIN)?;
            }
            let changed = doc.refresh_content();
            self.persist_checkpoint(document_id, &mut doc)?;
            changed
        };
        debug!("Checkpoint of {} merged", document_id);
        if let Some(content) = changed {
            let sequence = self.next_sequence();
            self.fan_out(RealtimeEvent::content_changed(
                document_id,
                CHECKPOINT_ORIGIN,
                &content,
                sequence,
            ))
            .await;
        }
        Ok(())
    }

    /// Merge into the hub replica, append to the log, then notify.
    async fn publish_operation(&self, operation: Operation) -> Result<()> {
        self.check_online()?;
        let doc = self.document_or_empty(&operation.document_id).await?;
        let changed = {
            let mut doc = doc.lock().await;
            doc.merge(&operation)?;
            if let Some(store) = &self.store {
                store.append_operation(&operation)?;
            }
            doc.log.push(operation.clone());
            doc.refresh_content()
        };
        self.stats.operations_published.fetch_add(1, Ordering::Relaxed);

        let sequence = self.next_sequence();
        self.fan_out(RealtimeEvent::operation_inserted(&operation, sequence))
            .await;
        if let Some(content) = changed {
            let sequence = self.next_sequence();
            self.fan_out(RealtimeEvent::content_changed(
                &operation.document_id,
                &operation.participant_id,
                &content,
                sequence,
            ))
            .await;
        }
        Ok(())
    }
}

impl PresenceBackend for RealtimeHub {
    async fn upsert_presence(&self, presence: ParticipantPresence) -> Result<()> {
        self.check_online()?;
        self.presence
            .write()
            .await
            .entry(presence.document_id.clone())
            .or_default()
            .insert(presence.participant_id.clone(), presence.clone());
        self.stats.presence_writes.fetch_add(1, Ordering::Relaxed);

        let sequence = self.next_sequence();
        self.fan_out(RealtimeEvent::presence_upserted(&presence, sequence))
            .await;
        Ok(())
    }

    async fn delete_presence(&self, document_id: &str, participant_id: &str) -> Result<()> {
        self.check_online()?;
        let removed = {
            let mut presence = self.presence.write().await;
            let removed = presence
                .get_mut(document_id)
                .and_then(|rows| rows.remove(participant_id))
                .is_some();
            if presence.get(document_id).is_some_and(BTreeMap::is_empty) {
                presence.remove(document_id);
            }
            removed
        };
        if removed {
            self.stats.presence_writes.fetch_add(1, Ordering::Relaxed);
            let sequence = self.next_sequence();
            self.fan_out(Ok(RealtimeEvent::presence_deleted(
                document_id,
                participant_id,
                sequence,
            )))
            .await;
        }
        Ok(())
    }

    async fn list_presence(&self, document_id: &str) -> Result<Vec<ParticipantPresence>> {
        self.check_online()?;
        let mut rows: Vec<ParticipantPresence> = self
            .presence
            .read()
            .await
            .get(document_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.participant_id.cmp(&b.participant_id))
        });
        Ok(rows)
    }

    async fn subscribe_presence(&self, document_id: &str) -> Result<EventReceiver> {
        self.subscribe(document_id).await
    }
}

/// Forward every operation published on the engine's document into
/// `handle_incoming_operation` until the room closes.
///
/// Subscribe before `initialize_document` so nothing published in between
/// is missed; duplicates merge away.
pub fn spawn_operation_feed<B, D>(
    engine: Arc<ConflictEngine<B, D>>,
    mut events: EventReceiver,
) -> JoinHandle<()>
where
    B: DocumentBackend + 'static,
    D: MergeableDocument + 'static,
{
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(e) => {
                    debug!("Operation feed for {} stopped: {}", engine.participant_id(), e);
                    return;
                }
            };
            if event.event_type != EventType::OperationInserted {
                continue;
            }
            match event.operation() {
                Ok(operation) => {
                    engine.handle_incoming_operation(operation);
                }
                Err(e) => warn!("Skipping malformed operation event: {}", e),
            }
        }
    })
}
