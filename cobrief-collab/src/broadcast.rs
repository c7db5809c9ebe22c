//! Per-document fan-out of realtime events with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each subscriber gets an independent receiver that buffers up to
//! `capacity` events; a subscriber that falls further behind skips the
//! oldest events and keeps going. Every consumer of these rooms treats
//! events as "something changed, re-read", so a skipped event costs
//! freshness, never correctness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{ProtocolError, RealtimeEvent};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub events_dropped: u64,
    pub subscribers: usize,
}

/// Lock-free counters shared with every receiver of the group.
#[derive(Default)]
struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
}

/// A broadcast group for a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many events are buffered per subscriber before
    /// a lagging subscriber starts skipping.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    /// Encode once and fan out. Returns how many subscribers got it.
    pub fn broadcast(&self, event: &RealtimeEvent) -> Result<usize, ProtocolError> {
        let encoded = event.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Receiving end of a [`BroadcastGroup`] that decodes events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<Vec<u8>>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl EventReceiver {
    /// Next event for this subscriber.
    ///
    /// Lag is counted and skipped, undecodable events are logged and
    /// skipped. Fails only once the group is gone.
    pub async fn recv(&mut self) -> Result<RealtimeEvent, ProtocolError> {
        loop {
            match self.receiver.recv().await {
                Ok(bytes) => match RealtimeEvent::decode(&bytes) {
                    Ok(event) => return Ok(event),
                    Err(e) => warn!("Skipping undecodable event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    self.stats.events_dropped.fetch_add(skipped, Ordering::Relaxed);
                    warn!("Subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return Err(ProtocolError::ChannelClosed),
            }
        }
    }
}

/// Maps document ids to broadcast groups so events never cross documents.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the room for `document_id`.
    pub async fn get_or_create(&self, document_id: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(document_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(document_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(document_id.to_string(), room.clone());
        room
    }

    pub async fn get(&self, document_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    /// Drop the room once nobody listens to it.
    pub async fn remove_if_empty(&self, document_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(document_id)
            .is_some_and(|room| room.subscriber_count() == 0)
        {
            rooms.remove(document_id);
            return true;
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
