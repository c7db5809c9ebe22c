//! cobrief-sim — drives simulated participants through the realtime hub.
//!
//! Three participants open the same brief, edit it concurrently, move their
//! cursors, follow each other and comment on text that later moves. Every
//! step is logged; pass a JSON config path to override the defaults used
//! for the run (`CollabConfig::for_testing()`).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cobrief_collab::{
    caret_point, spawn_operation_feed, CollabConfig, CursorPosition, CursorService, DocumentStore,
    FollowController, InteractionContext, InteractionKind, LocalInteraction, ParticipantMetadata,
    ParticipantPresence, PresenceService, PresenceStatus, PresenceWidget, RealtimeHub,
    TokioClock, Viewport, WidgetFeatures,
};
use cobrief_core::{
    get_range_pixel_position, AnchorState, AnchorTracker, AttrValue, Clock, CommentAnchor,
    ConflictEngine, FormatAttributes, MonospaceLayout, Operation, Rect,
    Result,
};
use env_logger::Env;
use log::{info, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

const BRIEF: &str = "Working title: Spring launch\n\
Audience: first-time buyers\n\
Research keywords: budget tents, ultralight packs\n\
Tone: friendly, practical";

const CHAR_WIDTH: f32 = 8.0;
const LINE_HEIGHT: f32 = 18.0;

struct Participant {
    id: &'static str,
    presence: Arc<PresenceService<RealtimeHub>>,
    cursors: CursorService<RealtimeHub>,
    engine: Arc<ConflictEngine<RealtimeHub>>,
    feed: JoinHandle<()>,
}

impl Participant {
    fn content(&self) -> String {
        self.engine
            .get_document_state()
            .map(|state| state.content)
            .unwrap_or_default()
    }
}

fn layout(text: &str) -> MonospaceLayout {
    MonospaceLayout::new(text, Rect::new(0.0, 0.0, 960.0, 720.0), CHAR_WIDTH, LINE_HEIGHT)
}

async fn open(
    hub: &Arc<RealtimeHub>,
    config: &CollabConfig,
    clock: &Arc<dyn Clock>,
    document_id: &str,
    id: &'static str,
    name: &str,
) -> Result<Participant> {
    let presence = Arc::new(
        PresenceService::new(hub.clone(), config.presence.clone()).with_clock(clock.clone()),
    );
    presence.sign_in(id);
    presence.join(document_id, ParticipantMetadata::named(name)).await?;

    let engine = Arc::new(
        ConflictEngine::with_config(id, hub.clone(), config.engine.clone()).with_clock(clock.clone()),
    );
    let feed = spawn_operation_feed(engine.clone(), hub.subscribe(document_id).await?);
    let source = engine.initialize_document(document_id).await?;
    info!("{} opened {} from {:?}", id, document_id, source);

    let cursors = CursorService::with_clock(presence.clone(), config.cursor.clone(), clock.clone());
    Ok(Participant {
        id,
        presence,
        cursors,
        engine,
        feed,
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => CollabConfig::load(&path)?,
        None => CollabConfig::for_testing(),
    };
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());

    let hub = Arc::new(match &config.store {
        Some(store) => {
            let store = DocumentStore::open(store.clone())?;
            info!("Persisting to {}", store.path().display());
            RealtimeHub::with_store(config.hub.clone(), Arc::new(store))
        }
        None => RealtimeHub::new(config.hub.clone()),
    });

    let document_id = format!("brief-{}", Uuid::new_v4());
    hub.create_document(&document_id, BRIEF).await?;

    let alice = open(&hub, &config, &clock, &document_id, "alice", "Alice Moreau").await?;
    let bob = open(&hub, &config, &clock, &document_id, "bob", "Bob Okafor").await?;
    let carol = open(&hub, &config, &clock, &document_id, "carol", "Carol Lin").await?;

    // ── Alice's view: cursors, follow mode, avatar strip ──

    let initial_layout = layout(BRIEF);
    let _cursor_feed = alice
        .cursors
        .attach(&document_id, move |p: &ParticipantPresence| {
            p.cursor.as_ref().and_then(|c| caret_point(&initial_layout, c))
        })
        .await?;

    let follow = Arc::new(Mutex::new(FollowController::new(alice.id, config.follow.clone())));
    let roster: Arc<Mutex<Vec<ParticipantPresence>>> = Arc::new(Mutex::new(Vec::new()));
    let (follow_sink, roster_sink, follow_clock) = (follow.clone(), roster.clone(), clock.clone());
    let _roster_feed = alice
        .presence
        .on_presence_change(&document_id, move |snapshot| {
            if let Ok(mut follow) = follow_sink.lock() {
                follow.apply_presence_snapshot(snapshot, follow_clock.now_millis());
            }
            if let Ok(mut roster) = roster_sink.lock() {
                *roster = snapshot.to_vec();
            }
        })
        .await?;

    // ── A comment on the keywords line ──

    let keywords = "budget tents";
    let start = char_offset(BRIEF, keywords).unwrap_or(0);
    let mut comment = AnchorTracker::new(CommentAnchor::new(
        "comment-1",
        start as i64,
        (start + keywords.chars().count()) as i64,
        keywords,
    ));
    log_anchor(&mut comment, &alice.content());

    // ── Concurrent edits ──

    let mut bold = FormatAttributes::new();
    bold.insert("bold".to_string(), AttrValue::Bool(true));
    let title_len = "Working title".chars().count();
    let (a, b, c) = tokio::join!(
        alice
            .engine
            .apply_operation(Operation::format(&document_id, alice.id, 0, title_len, bold)),
        bob.engine
            .apply_operation(Operation::insert(&document_id, bob.id, 0, "[DRAFT] ")),
        carol.engine.apply_operation(Operation::insert(
            &document_id,
            carol.id,
            BRIEF.chars().count(),
            "\nDeadline: May 3",
        )),
    );
    info!("Concurrent edits: alice={:?} bob={:?} carol={:?}", a, b, c);
    settle().await;
    report_convergence(&hub, &document_id, &[&alice, &bob, &carol]).await;
    log_anchor(&mut comment, &alice.content());

    // ── Offline publish, carried by the next one ──

    hub.set_offline(true);
    let pending = bob
        .engine
        .apply_operation(Operation::insert(&document_id, bob.id, 8, "v2 "))
        .await;
    hub.set_offline(false);
    let synced = bob
        .engine
        .apply_operation(Operation::insert(&document_id, bob.id, 11, "- "))
        .await;
    info!("While offline: {:?}, after reconnect: {:?}", pending, synced);
    settle().await;
    report_convergence(&hub, &document_id, &[&alice, &bob, &carol]).await;

    // ── Cursors and follow ──

    let focus = char_offset(&alice.content(), "ultralight").unwrap_or(0);
    if !follow.lock().map(|mut f| f.toggle_follow(bob.id)).unwrap_or(false) {
        warn!("Could not follow {}", bob.id);
    }
    let position = CursorPosition::caret(focus).with_viewport(Viewport::new(540.0, 0.0));
    bob.cursors.update_cursor_position(&document_id, position).await;
    carol
        .presence
        .update_status(&document_id, PresenceStatus::Editing, Some(CursorPosition::selection(0, 7)))
        .await;
    settle().await;
    for cursor in alice.cursors.rendered() {
        info!(
            "Cursor {} ({}) at ({:.0}, {:.0}){}",
            cursor.name,
            cursor.color,
            cursor.position.x,
            cursor.position.y,
            if cursor.is_moving { " moving" } else { "" }
        );
    }

    tokio::time::sleep(config.follow.debounce + Duration::from_millis(20)).await;
    if let Ok(mut follow) = follow.lock() {
        match follow.poll(clock.now_millis()) {
            Some(scroll) => info!("Auto-scroll to {:.0}px over {:?}", scroll.scroll_top, scroll.duration),
            None => info!("No auto-scroll pending"),
        }
    }

    // Clicking a comment thread must not register as a selection change.
    let mut interactions = InteractionContext::default();
    let token = interactions.begin(InteractionKind::CommentThread, clock.now_millis());
    info!(
        "Selection suppressed during comment click: {}",
        interactions.should_suppress_selection(clock.now_millis())
    );
    if let Ok(mut follow) = follow.lock() {
        follow.handle_interaction(LocalInteraction::PointerDown);
        info!("Following after pointer down: {}", follow.is_following());
    }
    interactions.end(&token);

    // ── Comment lands on moved text, then its text is removed ──

    let text = alice.content();
    if let AnchorState::Resolved { start, end } = log_anchor(&mut comment, &text) {
        match get_range_pixel_position(start, end, &layout(&text)) {
            Some(rect) => info!("Comment highlight at {:?}", rect),
            None => info!("Comment highlight not placeable"),
        }
        carol
            .engine
            .apply_operation(Operation::delete(&document_id, carol.id, start, end - start))
            .await;
        settle().await;
        log_anchor(&mut comment, &alice.content());
        if let Some(notice) = comment.drift_notice() {
            info!("{}", notice.message());
        }
        comment.dismiss_notice();
    }

    // ── Undo, metrics, checkpoint ──

    let undone = carol.engine.undo().await;
    settle().await;
    info!("Carol undo: {}", undone);
    report_convergence(&hub, &document_id, &[&alice, &bob, &carol]).await;
    log_anchor(&mut comment, &alice.content());
    for participant in [&alice, &bob, &carol] {
        let metrics = participant.engine.get_metrics();
        info!(
            "{}: {} applied, {} merged, avg {:?}",
            participant.id,
            metrics.operations_applied,
            metrics.conflicts_resolved,
            metrics.average_resolution_time
        );
    }
    alice.engine.checkpoint().await?;

    // ── Carol's client goes away without saying goodbye ──

    carol.presence.stop_heartbeat(&document_id);
    tokio::time::sleep(config.presence.active_timeout + config.presence.heartbeat_interval * 2).await;
    let widget = PresenceWidget::new(alice.id, WidgetFeatures::default());
    let model = match (roster.lock(), follow.lock()) {
        (Ok(roster), Ok(follow)) => widget.model(&roster, Some(&*follow)),
        _ => Default::default(),
    };
    let names: Vec<&str> = model.avatars.iter().map(|a| a.name.as_str()).collect();
    info!("Present: {:?} (+{})", names, model.overflow);

    for participant in [&alice, &bob, &carol] {
        participant.presence.sign_out();
        participant.feed.abort();
    }
    settle().await;

    let summary = serde_json::json!({
        "document": document_id,
        "content": hub.content(&document_id).await,
        "operations": hub.operations(&document_id).await.len(),
        "hub": {
            "operations_published": hub.stats().operations_published,
            "presence_writes": hub.stats().presence_writes,
            "rejected_offline": hub.stats().rejected_offline,
        },
    });
    info!("Summary: {}", summary);
    Ok(())
}

fn char_offset(text: &str, needle: &str) -> Option<usize> {
    text.find(needle).map(|byte| text[..byte].chars().count())
}

fn log_anchor(tracker: &mut AnchorTracker, text: &str) -> AnchorState {
    let state = tracker.refresh_text(text);
    info!("Comment {}: {:?}", tracker.anchor().comment_id, state);
    state
}

async fn report_convergence(hub: &RealtimeHub, document_id: &str, participants: &[&Participant]) {
    let authority = hub.content(document_id).await.unwrap_or_default();
    let diverged: Vec<&str> = participants
        .iter()
        .filter(|p| p.content() != authority)
        .map(|p| p.id)
        .collect();
    if diverged.is_empty() {
        info!("All replicas agree ({} chars)", authority.chars().count());
    } else {
        warn!("Replicas {:?} differ from the hub", diverged);
    }
}
