//! Presence, cursors and follow mode wired together over one hub.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cobrief_collab::{
    CursorConfig, CursorPosition, CursorService, FollowConfig, FollowController, HubConfig,
    LocalInteraction, ParticipantMetadata, ParticipantPresence, PresenceBackend, PresenceConfig,
    PresenceService, PresenceStatus, PresenceWidget, RealtimeHub, TokioClock, Vec2, Viewport,
    WidgetFeatures,
};
use cobrief_core::Clock;

const DOC: &str = "brief-presence";

fn participant(hub: &Arc<RealtimeHub>, id: &str, clock: &Arc<dyn Clock>) -> Arc<PresenceService<RealtimeHub>> {
    let service = Arc::new(
        PresenceService::new(hub.clone(), PresenceConfig::default()).with_clock(clock.clone()),
    );
    service.sign_in(id);
    service
}

fn ids(snapshot: &[ParticipantPresence]) -> Vec<String> {
    snapshot.iter().map(|p| p.participant_id.clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_room_lifecycle() {
    let hub = Arc::new(RealtimeHub::new(HubConfig::default()));
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(1_700_000_000_000));
    let alice = participant(&hub, "alice", &clock);
    let bob = participant(&hub, "bob", &clock);
    let carol = participant(&hub, "carol", &clock);

    alice.join(DOC, ParticipantMetadata::named("Alice")).await.unwrap();

    let latest: Arc<Mutex<Vec<ParticipantPresence>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = latest.clone();
    let _subscription = alice
        .on_presence_change(DOC, move |snapshot| {
            *sink.lock().unwrap() = snapshot.to_vec();
        })
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(1)).await;
    bob.join(DOC, ParticipantMetadata::named("Bob")).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    carol.join(DOC, ParticipantMetadata::named("Carol")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(ids(&latest.lock().unwrap()), vec!["alice", "bob", "carol"]);

    // Carol's client dies without leaving; everyone else keeps beating.
    carol.stop_heartbeat(DOC);
    tokio::time::sleep(Duration::from_secs(5 * 60 + 31)).await;
    assert_eq!(ids(&latest.lock().unwrap()), vec!["alice", "bob"]);
    assert_eq!(alice.get_active_participants(DOC, 5).await.unwrap().len(), 2);

    bob.leave(DOC);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(ids(&latest.lock().unwrap()), vec!["alice"]);
    assert_eq!(hub.list_presence(DOC).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cursor_follow_and_widget() {
    let hub = Arc::new(RealtimeHub::new(HubConfig::default()));
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(1_700_000_000_000));
    let me = participant(&hub, "me", &clock);
    let bob = participant(&hub, "bob", &clock);
    me.join(DOC, ParticipantMetadata::named("Me")).await.unwrap();
    bob.join(DOC, ParticipantMetadata::named("Bob Lee")).await.unwrap();

    let my_cursors = CursorService::with_clock(me.clone(), CursorConfig::default(), clock.clone());
    let bob_cursors = CursorService::with_clock(bob.clone(), CursorConfig::default(), clock.clone());
    let _cursor_feed = my_cursors
        .attach(DOC, |p: &ParticipantPresence| {
            p.cursor.map(|c| Vec2::new(c.to as f32 * 8.0, 0.0))
        })
        .await
        .unwrap();

    let follow = Arc::new(Mutex::new(FollowController::new("me", FollowConfig::default())));
    let snapshots: Arc<Mutex<Vec<ParticipantPresence>>> = Arc::new(Mutex::new(Vec::new()));
    let (follow_sink, snapshot_sink, follow_clock) = (follow.clone(), snapshots.clone(), clock.clone());
    let _follow_feed = me
        .on_presence_change(DOC, move |snapshot| {
            follow_sink
                .lock()
                .unwrap()
                .apply_presence_snapshot(snapshot, follow_clock.now_millis());
            *snapshot_sink.lock().unwrap() = snapshot.to_vec();
        })
        .await
        .unwrap();

    assert!(follow.lock().unwrap().toggle_follow("bob"));

    // Bob scrolls and moves his caret.
    let position = CursorPosition::caret(10).with_viewport(Viewport::new(800.0, 0.0));
    assert!(bob.update_status(DOC, PresenceStatus::Editing, Some(position)).await);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let rendered = my_cursors.rendered();
    assert_eq!(rendered.len(), 1);
    assert_eq!(rendered[0].name, "Bob Lee");
    assert_eq!(rendered[0].position, Vec2::new(80.0, 0.0));

    // Debounced: nothing before 500ms, then one scroll.
    assert_eq!(follow.lock().unwrap().poll(clock.now_millis()), None);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let scroll = follow.lock().unwrap().poll(clock.now_millis()).unwrap();
    assert_eq!(scroll.scroll_top, 800.0);
    assert!(follow.lock().unwrap().is_auto_scrolling());

    // A big caret jump animates, then settles.
    assert!(bob_cursors.update_cursor_position(DOC, CursorPosition::caret(100)).await);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(my_cursors.cursor("bob").unwrap().is_moving());
    tokio::time::sleep(Duration::from_secs(2)).await;
    let settled = my_cursors.cursor("bob").unwrap();
    assert!(!settled.is_moving());
    assert_eq!(settled.display(), Vec2::new(800.0, 0.0));

    let widget = PresenceWidget::new("me", WidgetFeatures::default());
    let model = widget.model(&snapshots.lock().unwrap(), Some(&*follow.lock().unwrap()));
    assert_eq!(model.follow_target.as_deref(), Some("bob"));
    let bob_avatar = model.avatars.iter().find(|a| a.participant_id == "bob").unwrap();
    assert!(bob_avatar.is_followed);
    assert_eq!(bob_avatar.initials, "BL");
    assert_eq!(bob_avatar.status, Some(PresenceStatus::Editing));

    // Local input wins.
    assert!(follow.lock().unwrap().handle_interaction(LocalInteraction::KeyDown));
    let model = widget.model(&snapshots.lock().unwrap(), Some(&*follow.lock().unwrap()));
    assert_eq!(model.follow_target, None);
}
