//! Cursor Broadcast & Smoothing Layer.
//!
//! Remote cursors arrive at network rate (a few updates per second, each
//! one a jump). They are rendered at frame rate by easing a display
//! position toward the latest target:
//!
//! ```text
//! presence snapshot ──► project(cursor) ──► target
//!                                             │
//!   tick (every frame while moving)           ▼
//!   display += (target - display) * 0.15 ──► snap within 1px ──► idle
//! ```
//!
//! The frame loop runs only while at least one cursor is moving and is
//! restarted by the next update that moves one. Local cursor updates go the
//! other way, through [`PresenceService::update_status`], throttled per
//! document with a trailing flush so the final position is never lost.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cobrief_core::{get_range_pixel_position, Clock, Result, SystemClock, TextContainer};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::duration_ms;
use crate::lock;
use crate::presence::{participant_color, PresenceBackend, PresenceService, PresenceSubscription};
use crate::protocol::{CursorPosition, ParticipantPresence, PresenceStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    /// Minimum spacing between local cursor broadcasts.
    #[serde(with = "duration_ms")]
    pub throttle: Duration,
    /// Fraction of the remaining distance covered per frame.
    pub smoothing: f32,
    /// Pixels under which the display position snaps to the target.
    pub snap_distance: f32,
    pub trail_length: usize,
    #[serde(with = "duration_ms")]
    pub trail_fade: Duration,
    #[serde(with = "duration_ms")]
    pub frame_interval: Duration,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(100),
            smoothing: 0.15,
            snap_distance: 1.0,
            trail_length: 8,
            trail_fade: Duration::from_secs(1),
            frame_interval: Duration::from_millis(16),
        }
    }
}

impl CursorConfig {
    pub fn for_testing() -> Self {
        Self {
            throttle: Duration::from_millis(50),
            smoothing: 0.5,
            ..Self::default()
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Geometry
// ───────────────────────────────────────────────────────────────────

/// 2D point in container pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Vec2) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Linear interpolation toward `target` by `t` in [0, 1].
    pub fn lerp(&self, target: &Vec2, t: f32) -> Vec2 {
        Vec2 {
            x: self.x + (target.x - self.x) * t,
            y: self.y + (target.y - self.y) * t,
        }
    }
}

/// Pixel position of a cursor's caret (its `to` end) inside `container`.
///
/// Uses the left edge of the character after the caret, or the right edge
/// of the one before it at the end of the text.
pub fn caret_point<C: TextContainer + ?Sized>(container: &C, cursor: &CursorPosition) -> Option<Vec2> {
    let at = cursor.to;
    if let Some(rect) = get_range_pixel_position(at, at + 1, container) {
        return Some(Vec2::new(rect.x, rect.y));
    }
    let before = at.checked_sub(1)?;
    get_range_pixel_position(before, at, container).map(|rect| Vec2::new(rect.x + rect.width, rect.y))
}

// ───────────────────────────────────────────────────────────────────
// Cursor state
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailPoint {
    pub position: Vec2,
    pub at: u64,
}

/// One remote participant's cursor as tracked locally.
#[derive(Debug, Clone)]
pub struct CursorState {
    pub participant_id: String,
    pub name: String,
    pub color: String,
    target: Vec2,
    display: Vec2,
    /// Pixels per second between the last two targets.
    velocity: Vec2,
    is_moving: bool,
    trail: VecDeque<TrailPoint>,
    last_update: u64,
}

impl CursorState {
    /// A cursor that appears directly at `position`.
    pub fn new(participant_id: &str, position: Vec2, now: u64) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            name: String::new(),
            color: participant_color(participant_id).to_string(),
            target: position,
            display: position,
            velocity: Vec2::ZERO,
            is_moving: false,
            trail: VecDeque::new(),
            last_update: now,
        }
    }

    pub fn target(&self) -> Vec2 {
        self.target
    }

    pub fn display(&self) -> Vec2 {
        self.display
    }

    pub fn velocity(&self) -> Vec2 {
        self.velocity
    }

    pub fn is_moving(&self) -> bool {
        self.is_moving
    }

    pub fn trail(&self) -> impl Iterator<Item = &TrailPoint> {
        self.trail.iter()
    }

    fn set_target(&mut self, position: Vec2, now: u64, config: &CursorConfig) {
        if position == self.target && !self.trail.is_empty() {
            return;
        }
        let dt = (now.saturating_sub(self.last_update) as f32 / 1000.0).max(0.001);
        self.velocity = Vec2::new(
            (position.x - self.target.x) / dt,
            (position.y - self.target.y) / dt,
        );
        self.target = position;
        self.last_update = now;
        if self.display.distance(&self.target) > config.snap_distance {
            self.is_moving = true;
        }

        self.trail.push_back(TrailPoint { position, at: now });
        while self.trail.len() > config.trail_length {
            self.trail.pop_front();
        }
    }

    /// Advance one frame. Returns whether the display position changed.
    fn step(&mut self, config: &CursorConfig) -> bool {
        if !self.is_moving {
            return false;
        }
        self.display = self.display.lerp(&self.target, config.smoothing.clamp(0.0, 1.0));
        if self.display.distance(&self.target) <= config.snap_distance {
            self.display = self.target;
            self.is_moving = false;
            self.velocity = Vec2::ZERO;
        }
        true
    }

    /// Drop trail points older than the fade window. Returns whether any went.
    fn prune_trail(&mut self, now: u64, fade_ms: u64) -> bool {
        let before = self.trail.len();
        while self
            .trail
            .front()
            .is_some_and(|point| now.saturating_sub(point.at) > fade_ms)
        {
            self.trail.pop_front();
        }
        self.trail.len() != before
    }

    fn render(&self, now: u64, fade_ms: u64) -> RenderedCursor {
        let trail = self
            .trail
            .iter()
            .filter_map(|point| {
                let age = now.saturating_sub(point.at);
                if age > fade_ms || fade_ms == 0 {
                    return None;
                }
                Some((point.position, 1.0 - age as f32 / fade_ms as f32))
            })
            .collect();
        RenderedCursor {
            participant_id: self.participant_id.clone(),
            name: self.name.clone(),
            color: self.color.clone(),
            position: self.display,
            is_moving: self.is_moving,
            trail,
        }
    }
}

/// Everything a renderer needs for one cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedCursor {
    pub participant_id: String,
    pub name: String,
    pub color: String,
    pub position: Vec2,
    pub is_moving: bool,
    /// Trail points with their opacity, oldest first.
    pub trail: Vec<(Vec2, f32)>,
}

// ───────────────────────────────────────────────────────────────────
// Layer
// ───────────────────────────────────────────────────────────────────

/// Remote cursors of one document. Pure state: time is passed in.
#[derive(Debug, Clone, Default)]
pub struct CursorLayer {
    config: CursorConfig,
    /// Our own participant, never rendered as a remote cursor.
    local_participant: Option<String>,
    cursors: HashMap<String, CursorState>,
}

impl CursorLayer {
    pub fn new(config: CursorConfig) -> Self {
        Self {
            config,
            local_participant: None,
            cursors: HashMap::new(),
        }
    }

    pub fn set_local_participant(&mut self, participant_id: Option<String>) {
        if let Some(id) = &participant_id {
            self.cursors.remove(id);
        }
        self.local_participant = participant_id;
    }

    pub fn config(&self) -> &CursorConfig {
        &self.config
    }

    /// Record a new raw position. Returns whether the cursor now needs
    /// animating.
    pub fn apply_remote_position(&mut self, participant_id: &str, position: Vec2, now: u64) -> bool {
        if self.local_participant.as_deref() == Some(participant_id) {
            return false;
        }
        let config = &self.config;
        let cursor = self
            .cursors
            .entry(participant_id.to_string())
            .or_insert_with(|| CursorState::new(participant_id, position, now));
        cursor.set_target(position, now, config);
        cursor.is_moving
    }

    /// Rebuild the cursor map from a full presence snapshot.
    ///
    /// Participants missing from the snapshot, or without a projectable
    /// cursor, disappear. Survivors keep their display position and trail so
    /// animation continues across snapshots.
    pub fn apply_presence_snapshot<P>(&mut self, snapshot: &[ParticipantPresence], now: u64, project: P) -> bool
    where
        P: Fn(&ParticipantPresence) -> Option<Vec2>,
    {
        let mut previous = std::mem::take(&mut self.cursors);
        for presence in snapshot {
            if self.local_participant.as_deref() == Some(presence.participant_id.as_str()) {
                continue;
            }
            let Some(position) = presence.cursor.as_ref().and(project(presence)) else {
                continue;
            };
            let mut cursor = previous
                .remove(&presence.participant_id)
                .unwrap_or_else(|| CursorState::new(&presence.participant_id, position, now));
            cursor.name = presence.metadata.name.clone();
            if !presence.metadata.color.is_empty() {
                cursor.color = presence.metadata.color.clone();
            }
            cursor.set_target(position, now, &self.config);
            self.cursors.insert(presence.participant_id.clone(), cursor);
        }
        if !previous.is_empty() {
            debug!("{} cursors left the snapshot", previous.len());
        }
        self.needs_animation()
    }

    pub fn remove(&mut self, participant_id: &str) -> bool {
        self.cursors.remove(participant_id).is_some()
    }

    /// Advance every moving cursor one frame and prune faded trail points.
    /// Returns whether another frame is needed.
    pub fn tick(&mut self, now: u64) -> bool {
        let fade_ms = self.config.trail_fade.as_millis() as u64;
        let mut moving = false;
        for cursor in self.cursors.values_mut() {
            cursor.step(&self.config);
            cursor.prune_trail(now, fade_ms);
            moving |= cursor.is_moving;
        }
        moving
    }

    pub fn needs_animation(&self) -> bool {
        self.cursors.values().any(|c| c.is_moving)
    }

    pub fn get(&self, participant_id: &str) -> Option<&CursorState> {
        self.cursors.get(participant_id)
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Render snapshot, sorted by participant id.
    pub fn rendered(&self, now: u64) -> Vec<RenderedCursor> {
        let fade_ms = self.config.trail_fade.as_millis() as u64;
        let mut cursors: Vec<RenderedCursor> = self
            .cursors
            .values()
            .map(|cursor| cursor.render(now, fade_ms))
            .collect();
        cursors.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        cursors
    }
}

// ───────────────────────────────────────────────────────────────────
// Service: animation loop, subscriptions, throttled local updates
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorSubscriptionId(u64);

type CursorCallback = Arc<dyn Fn(&[RenderedCursor]) + Send + Sync>;

struct Animation {
    layer: CursorLayer,
    running: bool,
}

struct Shared {
    animation: Mutex<Animation>,
    subscribers: Mutex<Vec<(CursorSubscriptionId, CursorCallback)>>,
    clock: Arc<dyn Clock>,
    frame_interval: Duration,
}

impl Shared {
    fn notify(&self, rendered: &[RenderedCursor]) {
        let callbacks: Vec<CursorCallback> = lock(&self.subscribers)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(rendered);
        }
    }

    /// Run `update` against the layer, publish the result, and make sure
    /// the frame loop is running if anything moves.
    fn update<F>(self: &Arc<Self>, update: F)
    where
        F: FnOnce(&mut CursorLayer, u64) -> bool,
    {
        let now = self.clock.now_millis();
        let (rendered, start) = {
            let mut animation = lock(&self.animation);
            let moving = update(&mut animation.layer, now);
            let start = moving && !animation.running;
            if start {
                animation.running = true;
            }
            (animation.layer.rendered(now), start)
        };
        self.notify(&rendered);
        if start {
            self.start_animation();
        }
    }

    fn start_animation(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime for cursor animation; waiting for manual ticks");
            lock(&self.animation).running = false;
            return;
        };
        let shared = self.clone();
        runtime.spawn(async move {
            trace!("Cursor animation started");
            loop {
                tokio::time::sleep(shared.frame_interval).await;
                let now = shared.clock.now_millis();
                let (rendered, more) = {
                    let mut animation = lock(&shared.animation);
                    let more = animation.layer.tick(now);
                    if !more {
                        animation.running = false;
                    }
                    (animation.layer.rendered(now), more)
                };
                shared.notify(&rendered);
                if !more {
                    trace!("Cursor animation idle");
                    return;
                }
            }
        });
    }
}

#[derive(Default)]
struct Outbox {
    last_sent: Option<u64>,
    pending: Option<CursorPosition>,
    flush: Option<JoinHandle<()>>,
}

/// Remote cursor smoothing plus throttled local cursor broadcast for one
/// participant.
pub struct CursorService<B> {
    presence: Arc<PresenceService<B>>,
    config: CursorConfig,
    shared: Arc<Shared>,
    outboxes: Arc<Mutex<HashMap<String, Outbox>>>,
    next_subscription: AtomicU64,
}

impl<B: PresenceBackend + 'static> CursorService<B> {
    pub fn new(presence: Arc<PresenceService<B>>, config: CursorConfig) -> Self {
        Self::with_clock(presence, config, Arc::new(SystemClock))
    }

    pub fn with_clock(presence: Arc<PresenceService<B>>, config: CursorConfig, clock: Arc<dyn Clock>) -> Self {
        let mut layer = CursorLayer::new(config.clone());
        layer.set_local_participant(presence.participant_id());
        Self {
            presence,
            shared: Arc::new(Shared {
                animation: Mutex::new(Animation {
                    layer,
                    running: false,
                }),
                subscribers: Mutex::new(Vec::new()),
                clock,
                frame_interval: config.frame_interval.max(Duration::from_millis(1)),
            }),
            config,
            outboxes: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: AtomicU64::new(1),
        }
    }

    // ── Remote cursors ──

    pub fn receive_position(&self, participant_id: &str, position: Vec2) {
        let participant_id = participant_id.to_string();
        self.shared
            .update(move |layer, now| layer.apply_remote_position(&participant_id, position, now));
    }

    pub fn receive_snapshot<P>(&self, snapshot: &[ParticipantPresence], project: P)
    where
        P: Fn(&ParticipantPresence) -> Option<Vec2>,
    {
        let local = self.presence.participant_id();
        self.shared.update(move |layer, now| {
            layer.set_local_participant(local);
            layer.apply_presence_snapshot(snapshot, now, project)
        });
    }

    /// Feed presence snapshots of `document_id` into the layer. `project`
    /// maps a participant's text cursor to pixels.
    pub async fn attach<P>(&self, document_id: &str, project: P) -> Result<PresenceSubscription>
    where
        P: Fn(&ParticipantPresence) -> Option<Vec2> + Send + Sync + 'static,
    {
        let shared = self.shared.clone();
        let local = self.presence.participant_id();
        self.presence
            .on_presence_change(document_id, move |snapshot| {
                let local = local.clone();
                shared.update(|layer, now| {
                    layer.set_local_participant(local);
                    layer.apply_presence_snapshot(snapshot, now, &project)
                });
            })
            .await
    }

    /// Advance one frame by hand. Returns whether another frame is needed.
    pub fn tick(&self) -> bool {
        let mut more = false;
        self.shared.update(|layer, now| {
            more = layer.tick(now);
            false
        });
        more
    }

    pub fn rendered(&self) -> Vec<RenderedCursor> {
        let now = self.shared.clock.now_millis();
        lock(&self.shared.animation).layer.rendered(now)
    }

    pub fn cursor(&self, participant_id: &str) -> Option<CursorState> {
        lock(&self.shared.animation).layer.get(participant_id).cloned()
    }

    pub fn is_animating(&self) -> bool {
        lock(&self.shared.animation).running
    }

    pub fn on_cursor_change<F>(&self, callback: F) -> CursorSubscriptionId
    where
        F: Fn(&[RenderedCursor]) + Send + Sync + 'static,
    {
        let id = CursorSubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.subscribers).push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: CursorSubscriptionId) -> bool {
        let mut subscribers = lock(&self.shared.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    // ── Local cursor ──

    /// Broadcast the local cursor through presence, at most once per
    /// throttle interval. Updates inside the interval are coalesced and the
    /// latest one is sent when it ends. Returns `false` only when an
    /// immediate send failed.
    pub async fn update_cursor_position(&self, document_id: &str, position: CursorPosition) -> bool {
        let now = self.shared.clock.now_millis();
        let throttle_ms = self.config.throttle.as_millis() as u64;
        {
            let mut outboxes = lock(&self.outboxes);
            let outbox = outboxes.entry(document_id.to_string()).or_default();
            if let Some(last) = outbox.last_sent.filter(|last| now < last + throttle_ms) {
                outbox.pending = Some(position);
                if outbox.flush.is_none() {
                    let delay = Duration::from_millis(last + throttle_ms - now);
                    outbox.flush = Some(self.spawn_flush(document_id, delay));
                }
                return true;
            }
            outbox.last_sent = Some(now);
            outbox.pending = None;
        }

        let status = self
            .presence
            .current_status(document_id)
            .unwrap_or(PresenceStatus::Viewing);
        self.presence
            .update_status(document_id, status, Some(position))
            .await
    }

    fn spawn_flush(&self, document_id: &str, delay: Duration) -> JoinHandle<()> {
        let presence = self.presence.clone();
        let outboxes = self.outboxes.clone();
        let clock = self.shared.clock.clone();
        let document_id = document_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let pending = {
                let mut outboxes = lock(&outboxes);
                let Some(outbox) = outboxes.get_mut(&document_id) else {
                    return;
                };
                outbox.flush = None;
                let pending = outbox.pending.take();
                if pending.is_some() {
                    outbox.last_sent = Some(clock.now_millis());
                }
                pending
            };
            if let Some(position) = pending {
                let status = presence
                    .current_status(&document_id)
                    .unwrap_or(PresenceStatus::Viewing);
                presence.update_status(&document_id, status, Some(position)).await;
            }
        })
    }
}

impl<B> Drop for CursorService<B> {
    fn drop(&mut self) {
        for outbox in lock(&self.outboxes).values_mut() {
            if let Some(flush) = outbox.flush.take() {
                flush.abort();
            }
        }
    }
}
