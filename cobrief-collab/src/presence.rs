//! Presence Service: who is in a document, what they are doing, and where
//! their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! join(doc) ──► upsert (viewing) ──► heartbeat task ──► upsert every 30s
//!                      │
//!                      ▼
//!              PresenceBackend ──► RealtimeEvent::PresenceUpserted/Deleted
//!                                         │
//!                                         ▼
//!                    on_presence_change ──► list + freshness filter
//!                                         │
//!                                         ▼
//!                               callback(full active set)
//! ```
//!
//! Presence is eventually consistent. A record counts as active while its
//! last heartbeat is inside the activity window; nothing is ever deleted
//! for being stale, it simply stops showing up.
//!
//! ## Failure handling
//!
//! | Call | On network failure |
//! |------|--------------------|
//! | `join` | error returned |
//! | heartbeat | logged, next tick retries |
//! | `leave` | fire-and-forget, logged |
//! | `update_status` | logged, `false` returned |

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cobrief_core::{Clock, CollabError, Result, SystemClock};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::broadcast::EventReceiver;
use crate::config::duration_ms;
use crate::lock;
use crate::protocol::{CursorPosition, ParticipantMetadata, ParticipantPresence, PresenceStatus};

// ───────────────────────────────────────────────────────────────────
// Backend seam
// ───────────────────────────────────────────────────────────────────

/// Presence table plus its change feed.
pub trait PresenceBackend: Send + Sync {
    fn upsert_presence(&self, presence: ParticipantPresence) -> impl Future<Output = Result<()>> + Send;

    fn delete_presence(
        &self,
        document_id: &str,
        participant_id: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn list_presence(
        &self,
        document_id: &str,
    ) -> impl Future<Output = Result<Vec<ParticipantPresence>>> + Send;

    /// Change events for the document, presence and otherwise.
    fn subscribe_presence(
        &self,
        document_id: &str,
    ) -> impl Future<Output = Result<EventReceiver>> + Send;
}

// ───────────────────────────────────────────────────────────────────
// Configuration & colors
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Records with an older heartbeat are left out of snapshots.
    #[serde(with = "duration_ms")]
    pub active_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            active_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl PresenceConfig {
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            active_timeout: Duration::from_secs(5),
        }
    }
}

const PALETTE: [&str; 12] = [
    "#E57373", "#F06292", "#BA68C8", "#9575CD", "#7986CB", "#64B5F6",
    "#4FC3F7", "#4DD0E1", "#4DB6AC", "#81C784", "#FFB74D", "#A1887F",
];

/// Stable display color for a participant.
pub fn participant_color(participant_id: &str) -> &'static str {
    let hash = participant_id
        .bytes()
        .fold(0x811c_9dc5_u32, |hash, byte| {
            (hash ^ byte as u32).wrapping_mul(0x0100_0193)
        });
    PALETTE[hash as usize % PALETTE.len()]
}

// ───────────────────────────────────────────────────────────────────
// Service
// ───────────────────────────────────────────────────────────────────

/// Returned by [`PresenceService::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceHandle {
    pub document_id: String,
    pub participant_id: String,
}

struct Membership {
    /// Latest local record; the heartbeat re-sends it.
    record: Arc<Mutex<ParticipantPresence>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Membership {
    fn stop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

/// Delivery task of [`PresenceService::on_presence_change`]. Dropping it
/// cancels the subscription.
pub struct PresenceSubscription {
    task: JoinHandle<()>,
}

impl PresenceSubscription {
    pub fn cancel(self) {}

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PresenceSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct PresenceService<B> {
    backend: Arc<B>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
    /// Participant of the signed-in session.
    session: Mutex<Option<String>>,
    memberships: Mutex<HashMap<String, Membership>>,
}

impl<B: PresenceBackend + 'static> PresenceService<B> {
    pub fn new(backend: Arc<B>, config: PresenceConfig) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
            config,
            session: Mutex::new(None),
            memberships: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    // ── Session ──

    pub fn sign_in(&self, participant_id: &str) {
        *lock(&self.session) = Some(participant_id.to_string());
    }

    /// End the session and leave every joined document.
    pub fn sign_out(&self) {
        let joined = self.joined_documents();
        for document_id in &joined {
            self.leave(document_id);
        }
        *lock(&self.session) = None;
    }

    pub fn participant_id(&self) -> Option<String> {
        lock(&self.session).clone()
    }

    fn require_session(&self, action: &str) -> Result<String> {
        self.participant_id().ok_or_else(|| {
            warn!("{} aborted: {}", action, CollabError::AuthenticationMissing);
            CollabError::AuthenticationMissing
        })
    }

    // ── Membership ──

    /// Announce the caller in `document_id` as viewing and start the
    /// heartbeat. Rejoining keeps the original join time.
    pub async fn join(
        &self,
        document_id: &str,
        mut metadata: ParticipantMetadata,
    ) -> Result<PresenceHandle> {
        let participant_id = self.require_session("join")?;
        if metadata.color.is_empty() {
            metadata.color = participant_color(&participant_id).to_string();
        }
        let now = self.clock.now_millis();
        let joined_at = lock(&self.memberships)
            .get(document_id)
            .map_or(now, |m| lock(&m.record).joined_at);
        let record = ParticipantPresence {
            participant_id: participant_id.clone(),
            document_id: document_id.to_string(),
            status: PresenceStatus::Viewing,
            cursor: None,
            last_heartbeat: now,
            joined_at,
            metadata,
        };

        self.backend.upsert_presence(record.clone()).await?;

        let record = Arc::new(Mutex::new(record));
        let membership = Membership {
            heartbeat: Some(self.spawn_heartbeat(record.clone())),
            record,
        };
        if let Some(mut previous) = lock(&self.memberships).insert(document_id.to_string(), membership)
        {
            previous.stop();
        }
        info!("{} joined {}", participant_id, document_id);

        Ok(PresenceHandle {
            document_id: document_id.to_string(),
            participant_id,
        })
    }

    fn spawn_heartbeat(&self, record: Arc<Mutex<ParticipantPresence>>) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let clock = self.clock.clone();
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let beat = {
                    let mut record = lock(&record);
                    record.last_heartbeat = clock.now_millis();
                    record.clone()
                };
                if let Err(e) = backend.upsert_presence(beat.clone()).await {
                    warn!(
                        "Heartbeat for {} in {} failed, retrying next tick: {}",
                        beat.participant_id, beat.document_id, e
                    );
                }
            }
        })
    }

    /// Stop the heartbeat and remove the caller's record without waiting
    /// for the backend.
    pub fn leave(&self, document_id: &str) {
        let Ok(participant_id) = self.require_session("leave") else {
            return;
        };
        if let Some(mut membership) = lock(&self.memberships).remove(document_id) {
            membership.stop();
        }

        let backend = self.backend.clone();
        let document = document_id.to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = backend.delete_presence(&document, &participant_id).await {
                        debug!("Leave of {} from {} not delivered: {}", participant_id, document, e);
                    }
                });
            }
            Err(_) => warn!("Leave of {} not sent: no async runtime", document_id),
        }
        info!("Left {}", document_id);
    }

    /// Stop heartbeating without removing the record, as a crashed or
    /// suspended client would. The record goes stale on its own.
    pub fn stop_heartbeat(&self, document_id: &str) -> bool {
        match lock(&self.memberships).get_mut(document_id) {
            Some(membership) if membership.heartbeat.is_some() => {
                membership.stop();
                true
            }
            _ => false,
        }
    }

    pub fn is_joined(&self, document_id: &str) -> bool {
        lock(&self.memberships).contains_key(document_id)
    }

    pub fn joined_documents(&self) -> Vec<String> {
        lock(&self.memberships).keys().cloned().collect()
    }

    /// Status last sent for a joined document.
    pub fn current_status(&self, document_id: &str) -> Option<PresenceStatus> {
        lock(&self.memberships)
            .get(document_id)
            .map(|membership| lock(&membership.record).status)
    }

    /// Upsert the caller's status, and cursor when given. `None` keeps the
    /// previous cursor. Returns whether the backend accepted it.
    pub async fn update_status(
        &self,
        document_id: &str,
        status: PresenceStatus,
        cursor: Option<CursorPosition>,
    ) -> bool {
        let Ok(participant_id) = self.require_session("update_status") else {
            return false;
        };
        let now = self.clock.now_millis();
        let record = {
            let memberships = lock(&self.memberships);
            match memberships.get(document_id) {
                Some(membership) => {
                    let mut record = lock(&membership.record);
                    record.status = status;
                    if cursor.is_some() {
                        record.cursor = cursor;
                    }
                    record.last_heartbeat = now;
                    record.clone()
                }
                None => ParticipantPresence {
                    metadata: ParticipantMetadata {
                        color: participant_color(&participant_id).to_string(),
                        ..ParticipantMetadata::default()
                    },
                    participant_id,
                    document_id: document_id.to_string(),
                    status,
                    cursor,
                    last_heartbeat: now,
                    joined_at: now,
                },
            }
        };

        match self.backend.upsert_presence(record).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Status update for {} failed: {}", document_id, e);
                false
            }
        }
    }

    // ── Queries ──

    /// Records whose heartbeat is within `timeout_minutes`, oldest join first.
    pub async fn get_active_participants(
        &self,
        document_id: &str,
        timeout_minutes: u64,
    ) -> Result<Vec<ParticipantPresence>> {
        let window = Duration::from_secs(timeout_minutes.saturating_mul(60));
        active_snapshot(self.backend.as_ref(), self.clock.as_ref(), document_id, window).await
    }

    /// Call `callback` with the full active set now and after every change.
    ///
    /// Also re-checks once per heartbeat interval so participants that went
    /// stale without an event drop out of the set.
    pub async fn on_presence_change<F>(
        &self,
        document_id: &str,
        callback: F,
    ) -> Result<PresenceSubscription>
    where
        F: Fn(&[ParticipantPresence]) + Send + Sync + 'static,
    {
        let mut events = self.backend.subscribe_presence(document_id).await?;
        let backend = self.backend.clone();
        let clock = self.clock.clone();
        let window = self.config.active_timeout;
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let document_id = document_id.to_string();

        let mut delivered = match active_snapshot(backend.as_ref(), clock.as_ref(), &document_id, window).await {
            Ok(snapshot) => {
                callback(&snapshot);
                Some(participant_ids(&snapshot))
            }
            Err(e) => {
                warn!("Initial presence snapshot for {} failed: {}", document_id, e);
                None
            }
        };

        let task = tokio::spawn(async move {
            let mut expiry = tokio::time::interval_at(Instant::now() + period, period);
            expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let changed = tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => event.is_presence(),
                        Err(e) => {
                            debug!("Presence feed for {} closed: {}", document_id, e);
                            return;
                        }
                    },
                    _ = expiry.tick() => false,
                };

                let snapshot = match active_snapshot(backend.as_ref(), clock.as_ref(), &document_id, window).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!("Presence snapshot for {} failed: {}", document_id, e);
                        continue;
                    }
                };
                let ids = participant_ids(&snapshot);
                if changed || delivered.as_ref() != Some(&ids) {
                    callback(&snapshot);
                    delivered = Some(ids);
                }
            }
        });

        Ok(PresenceSubscription { task })
    }
}

impl<B> Drop for PresenceService<B> {
    fn drop(&mut self) {
        for membership in lock(&self.memberships).values_mut() {
            membership.stop();
        }
    }
}

async fn active_snapshot<B: PresenceBackend>(
    backend: &B,
    clock: &dyn Clock,
    document_id: &str,
    window: Duration,
) -> Result<Vec<ParticipantPresence>> {
    let rows = backend.list_presence(document_id).await?;
    let now = clock.now_millis();
    let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    Ok(rows
        .into_iter()
        .filter(|row| row.is_active(now, window_ms))
        .collect())
}

fn participant_ids(snapshot: &[ParticipantPresence]) -> Vec<String> {
    snapshot.iter().map(|p| p.participant_id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::clock::TokioClock;
    use crate::hub::{HubConfig, RealtimeHub};

    fn service(hub: &Arc<RealtimeHub>, participant: &str) -> PresenceService<RealtimeHub> {
        let service = PresenceService::new(hub.clone(), PresenceConfig::default())
            .with_clock(Arc::new(TokioClock::starting_at(1_000_000)));
        service.sign_in(participant);
        service
    }

    /// Let spawned tasks run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    // ── Color tests ──

    #[test]
    fn test_participant_color_stable() {
        assert_eq!(participant_color("alice"), participant_color("alice"));
        assert!(PALETTE.contains(&participant_color("")));
        let distinct: std::collections::HashSet<&str> =
            (0..50).map(|i| participant_color(&format!("user-{i}"))).collect();
        assert!(distinct.len() > 6);
    }

    // ── Join / leave tests ──

    #[tokio::test(start_paused = true)]
    async fn test_join_creates_viewing_record() {
        let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
        let alice = service(&hub, "alice");

        let handle = alice
            .join("doc", ParticipantMetadata::named("Alice"))
            .await
            .unwrap();
        assert_eq!(handle.participant_id, "alice");
        assert!(alice.is_joined("doc"));

        let rows = hub.list_presence("doc").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, PresenceStatus::Viewing);
        assert_eq!(rows[0].metadata.color, participant_color("alice"));
    }

    #[tokio::test]
    async fn test_join_without_session_fails() {
        let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
        let anonymous = PresenceService::new(hub.clone(), PresenceConfig::default());
        assert_eq!(
            anonymous.join("doc", ParticipantMetadata::default()).await,
            Err(CollabError::AuthenticationMissing)
        );
        assert!(!anonymous.update_status("doc", PresenceStatus::Idle, None).await);
        anonymous.leave("doc");
        assert!(hub.list_presence("doc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_join_surfaces() {
        let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
        let alice = service(&hub, "alice");
        hub.set_offline(true);
        let err = alice.join("doc", ParticipantMetadata::default()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!alice.is_joined("doc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_refreshes_record() {
        let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
        let alice = service(&hub, "alice");
        alice.join("doc", ParticipantMetadata::default()).await.unwrap();
        let first = hub.list_presence("doc").await.unwrap()[0].last_heartbeat;

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;

        let row = &hub.list_presence("doc").await.unwrap()[0];
        assert!(row.last_heartbeat >= first + 30_000);
        assert_eq!(row.joined_at, first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_survives_outage() {
        let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
        let alice = service(&hub, "alice");
        alice.join("doc", ParticipantMetadata::default()).await.unwrap();

        hub.set_offline(true);
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        hub.set_offline(false);
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;

        let row = &hub.list_presence("doc").await.unwrap()[0];
        assert!(row.last_heartbeat >= 1_000_000 + 60_000);
    }

    #[tokio::test]
    async fn test_leave_removes_record() {
        let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
        let alice = service(&hub, "alice");
        alice.join("doc", ParticipantMetadata::default()).await.unwrap();

        alice.leave("doc");
        assert!(!alice.is_joined("doc"));
        settle().await;
        assert!(hub.list_presence("doc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_status_keeps_cursor() {
        let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
        let alice = service(&hub, "alice");
        alice.join("doc", ParticipantMetadata::default()).await.unwrap();

        assert!(
            alice
                .update_status("doc", PresenceStatus::Editing, Some(CursorPosition::caret(4)))
                .await
        );
        assert!(alice.update_status("doc", PresenceStatus::Idle, None).await);

        let row = &hub.list_presence("doc").await.unwrap()[0];
        assert_eq!(row.status, PresenceStatus::Idle);
        assert_eq!(row.cursor, Some(CursorPosition::caret(4)));

        hub.set_offline(true);
        assert!(!alice.update_status("doc", PresenceStatus::Editing, None).await);
    }

    #[tokio::test]
    async fn test_sign_out_leaves_everything() {
        let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
        let alice = service(&hub, "alice");
        alice.join("a", ParticipantMetadata::default()).await.unwrap();
        alice.join("b", ParticipantMetadata::default()).await.unwrap();

        alice.sign_out();
        settle().await;
        assert!(alice.joined_documents().is_empty());
        assert!(alice.participant_id().is_none());
        assert!(hub.list_presence("a").await.unwrap().is_empty());
        assert!(hub.list_presence("b").await.unwrap().is_empty());
    }

    // ── Snapshot tests ──

    #[tokio::test(start_paused = true)]
    async fn test_stale_participant_drops_out() {
        let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
        let alice = service(&hub, "alice");
        let bob = service(&hub, "bob");
        alice.join("doc", ParticipantMetadata::default()).await.unwrap();
        bob.join("doc", ParticipantMetadata::default()).await.unwrap();
        assert_eq!(alice.get_active_participants("doc", 5).await.unwrap().len(), 2);

        assert!(bob.stop_heartbeat("doc"));
        tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
        settle().await;

        let active = alice.get_active_participants("doc", 5).await.unwrap();
        let ids: Vec<&str> = active.iter().map(|p| p.participant_id.as_str()).collect();
        assert_eq!(ids, vec!["alice"]);
        // Still in the table, just not active.
        assert_eq!(hub.list_presence("doc").await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_keeps_everyone_active() {
        let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
        let alice = service(&hub, "alice");
        let bob = service(&hub, "bob");
        alice.join("doc", ParticipantMetadata::default()).await.unwrap();
        bob.join("doc", ParticipantMetadata::default()).await.unwrap();

        assert!(bob.stop_heartbeat("doc"));
        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        settle().await;

        let active = alice.get_active_participants("doc", u64::MAX).await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_change_delivers_snapshots() {
        let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
        let alice = service(&hub, "alice");
        let bob = service(&hub, "bob");
        alice.join("doc", ParticipantMetadata::default()).await.unwrap();

        let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = alice
            .on_presence_change("doc", move |snapshot| {
                lock(&sink).push(participant_ids(snapshot));
            })
            .await
            .unwrap();

        bob.join("doc", ParticipantMetadata::default()).await.unwrap();
        settle().await;
        bob.leave("doc");
        settle().await;

        let seen = lock(&seen).clone();
        assert_eq!(seen.first().unwrap(), &vec!["alice".to_string()]);
        assert!(seen.contains(&vec!["alice".to_string(), "bob".to_string()]));
        assert_eq!(seen.last().unwrap(), &vec!["alice".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_change_reports_expiry() {
        let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
        let alice = service(&hub, "alice");
        let bob = service(&hub, "bob");
        alice.join("doc", ParticipantMetadata::default()).await.unwrap();
        bob.join("doc", ParticipantMetadata::default()).await.unwrap();

        let latest: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = latest.clone();
        let subscription = alice
            .on_presence_change("doc", move |snapshot| {
                *lock(&sink) = participant_ids(snapshot);
            })
            .await
            .unwrap();
        assert_eq!(lock(&latest).len(), 2);

        bob.stop_heartbeat("doc");
        for _ in 0..11 {
            tokio::time::advance(Duration::from_secs(30)).await;
            settle().await;
        }
        assert_eq!(*lock(&latest), vec!["alice".to_string()]);
        assert!(subscription.is_active());
        subscription.cancel();
    }
}
