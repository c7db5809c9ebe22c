//! Follow mode: keep the local viewport on another participant's.
//!
//! ```text
//! followed viewport ──► debounce (500ms) ──► poll() ──► ScrollCommand
//!                                                        │
//!                                  is_auto_scrolling ◄───┘ (scroll_duration)
//!
//! pointer / key / wheel / touch ──► handle_interaction ──► follow cleared
//! ```
//!
//! Everything here is synchronous and takes time as an argument, so a
//! cancelling input is always applied before the next render reads
//! [`FollowController::is_following`].

use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::protocol::{ParticipantPresence, Viewport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowConfig {
    /// Quiet period after the followed viewport last moved.
    #[serde(with = "duration_ms")]
    pub debounce: Duration,
    /// Length of the smooth scroll; scroll events inside it are ours.
    #[serde(with = "duration_ms")]
    pub scroll_duration: Duration,
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            scroll_duration: Duration::from_millis(300),
        }
    }
}

impl FollowConfig {
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            scroll_duration: Duration::from_millis(30),
        }
    }
}

/// Local input that always wins over auto-scroll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalInteraction {
    PointerDown,
    KeyDown,
    Wheel,
    TouchStart,
}

/// Present only while a follow relation is active.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowModeState {
    pub follower_id: String,
    pub followed_id: String,
    pub is_auto_scrolling: bool,
    pub last_sync_timestamp: u64,
}

/// Smooth scroll the renderer should perform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollCommand {
    pub scroll_top: f64,
    pub scroll_left: f64,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct FollowController {
    config: FollowConfig,
    follower_id: String,
    state: Option<FollowModeState>,
    /// Latest followed viewport and when it may be applied.
    pending: Option<(Viewport, u64)>,
    last_seen: Option<Viewport>,
    auto_scroll_until: u64,
}

impl FollowController {
    pub fn new(follower_id: &str, config: FollowConfig) -> Self {
        Self {
            config,
            follower_id: follower_id.to_string(),
            state: None,
            pending: None,
            last_seen: None,
            auto_scroll_until: 0,
        }
    }

    pub fn is_following(&self) -> bool {
        self.state.is_some()
    }

    pub fn followed_id(&self) -> Option<&str> {
        self.state.as_ref().map(|s| s.followed_id.as_str())
    }

    pub fn state(&self) -> Option<&FollowModeState> {
        self.state.as_ref()
    }

    /// Start following `participant_id`, or stop if already following them.
    /// Returns whether a follow relation is active afterwards.
    pub fn toggle_follow(&mut self, participant_id: &str) -> bool {
        if participant_id == self.follower_id {
            return self.is_following();
        }
        if self.followed_id() == Some(participant_id) {
            self.cancel();
            return false;
        }
        self.clear();
        self.state = Some(FollowModeState {
            follower_id: self.follower_id.clone(),
            followed_id: participant_id.to_string(),
            is_auto_scrolling: false,
            last_sync_timestamp: 0,
        });
        info!("{} following {}", self.follower_id, participant_id);
        true
    }

    pub fn cancel(&mut self) {
        if let Some(state) = self.state.take() {
            info!("{} stopped following {}", state.follower_id, state.followed_id);
        }
        self.clear();
    }

    fn clear(&mut self) {
        self.state = None;
        self.pending = None;
        self.last_seen = None;
        self.auto_scroll_until = 0;
    }

    /// Viewport report from `participant_id`. Only the followed participant
    /// counts; each report restarts the debounce window.
    pub fn on_viewport(&mut self, participant_id: &str, viewport: Viewport, now: u64) -> bool {
        if self.followed_id() != Some(participant_id) {
            return false;
        }
        if self.last_seen == Some(viewport) {
            return false;
        }
        self.last_seen = Some(viewport);
        let debounce = self.config.debounce.as_millis() as u64;
        self.pending = Some((viewport, now + debounce));
        true
    }

    /// Pick the followed participant's viewport out of a presence snapshot.
    /// Follow ends if they are no longer present.
    pub fn apply_presence_snapshot(&mut self, snapshot: &[ParticipantPresence], now: u64) {
        let Some(followed) = self.followed_id().map(str::to_string) else {
            return;
        };
        let Some(presence) = snapshot.iter().find(|p| p.participant_id == followed) else {
            debug!("{} left, ending follow", followed);
            self.cancel();
            return;
        };
        if let Some(viewport) = presence.cursor.and_then(|c| c.viewport) {
            self.on_viewport(&followed, viewport, now);
        }
    }

    /// Called every frame. Emits the scroll once the debounce window has
    /// passed, and ends the auto-scroll guard when the scroll is done.
    pub fn poll(&mut self, now: u64) -> Option<ScrollCommand> {
        let state = self.state.as_mut()?;
        if state.is_auto_scrolling && now >= self.auto_scroll_until {
            state.is_auto_scrolling = false;
        }
        match self.pending {
            Some((viewport, due)) if now >= due => {
                self.pending = None;
                state.is_auto_scrolling = true;
                state.last_sync_timestamp = now;
                self.auto_scroll_until = now + self.config.scroll_duration.as_millis() as u64;
                Some(ScrollCommand {
                    scroll_top: viewport.scroll_top,
                    scroll_left: viewport.scroll_left,
                    duration: self.config.scroll_duration,
                })
            }
            _ => None,
        }
    }

    pub fn is_auto_scrolling(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.is_auto_scrolling)
    }

    /// Local input: ends follow immediately. Returns whether it did.
    pub fn handle_interaction(&mut self, interaction: LocalInteraction) -> bool {
        if !self.is_following() {
            return false;
        }
        debug!("{:?} cancels follow", interaction);
        self.cancel();
        true
    }

    /// A plain scroll event. Ignored while our own smooth scroll runs,
    /// otherwise it is the user taking over.
    pub fn handle_scroll(&mut self, now: u64) -> bool {
        if !self.is_following() {
            return false;
        }
        if self.is_auto_scrolling() && now < self.auto_scroll_until {
            return false;
        }
        self.cancel();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::{CursorPosition, ParticipantMetadata, PresenceStatus};

    fn following_bob() -> FollowController {
        let mut follow = FollowController::new("me", FollowConfig::default());
        assert!(follow.toggle_follow("bob"));
        follow
    }

    fn row(participant_id: &str, viewport: Option<Viewport>) -> ParticipantPresence {
        ParticipantPresence {
            participant_id: participant_id.into(),
            document_id: "doc".into(),
            status: PresenceStatus::Viewing,
            cursor: viewport.map(|v| CursorPosition::caret(0).with_viewport(v)),
            last_heartbeat: 0,
            joined_at: 0,
            metadata: ParticipantMetadata::default(),
        }
    }

    #[test]
    fn test_toggle_follow() {
        let mut follow = FollowController::new("me", FollowConfig::default());
        assert!(!follow.toggle_follow("me"));
        assert!(follow.toggle_follow("bob"));
        assert_eq!(follow.followed_id(), Some("bob"));
        assert_eq!(follow.state().unwrap().follower_id, "me");
        assert!(follow.toggle_follow("carol"));
        assert_eq!(follow.followed_id(), Some("carol"));
        assert!(!follow.toggle_follow("carol"));
        assert!(follow.state().is_none());
    }

    #[test]
    fn test_viewport_debounced() {
        let mut follow = following_bob();
        assert!(!follow.on_viewport("carol", Viewport::new(10.0, 0.0), 0));
        assert!(follow.on_viewport("bob", Viewport::new(100.0, 0.0), 0));
        assert!(follow.on_viewport("bob", Viewport::new(200.0, 0.0), 300));
        assert_eq!(follow.poll(600), None);

        let scroll = follow.poll(800).unwrap();
        assert_eq!(scroll.scroll_top, 200.0);
        assert_eq!(scroll.duration, Duration::from_millis(300));
        assert_eq!(follow.poll(900), None);
        assert_eq!(follow.state().unwrap().last_sync_timestamp, 800);
    }

    #[test]
    fn test_auto_scroll_guard() {
        let mut follow = following_bob();
        follow.on_viewport("bob", Viewport::new(100.0, 0.0), 0);
        follow.poll(500).unwrap();
        assert!(follow.is_auto_scrolling());

        // Our own scroll does not cancel.
        assert!(!follow.handle_scroll(600));
        assert!(follow.is_following());

        follow.poll(800);
        assert!(!follow.is_auto_scrolling());
        assert!(follow.handle_scroll(900));
        assert!(!follow.is_following());
    }

    #[test]
    fn test_local_input_cancels_immediately() {
        for interaction in [
            LocalInteraction::PointerDown,
            LocalInteraction::KeyDown,
            LocalInteraction::Wheel,
            LocalInteraction::TouchStart,
        ] {
            let mut follow = following_bob();
            follow.on_viewport("bob", Viewport::new(100.0, 0.0), 0);
            follow.poll(500);
            assert!(follow.is_auto_scrolling());

            assert!(follow.handle_interaction(interaction));
            assert!(!follow.is_following());
            assert_eq!(follow.poll(10_000), None);
        }
        let mut idle = FollowController::new("me", FollowConfig::default());
        assert!(!idle.handle_interaction(LocalInteraction::Wheel));
    }

    #[test]
    fn test_snapshot_drives_follow() {
        let mut follow = following_bob();
        let snapshot = vec![row("me", None), row("bob", Some(Viewport::new(40.0, 5.0)))];
        follow.apply_presence_snapshot(&snapshot, 0);
        // Same viewport again does not restart the window.
        follow.apply_presence_snapshot(&snapshot, 400);
        let scroll = follow.poll(500).unwrap();
        assert_eq!((scroll.scroll_top, scroll.scroll_left), (40.0, 5.0));

        follow.apply_presence_snapshot(&[row("me", None)], 600);
        assert!(!follow.is_following());
    }
}
