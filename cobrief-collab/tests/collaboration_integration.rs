//! End-to-end editing through the realtime hub.
//!
//! Verifies:
//! - Concurrent edits from two engines converge on every replica and the hub
//! - Publishes that fail while offline ride along with the next one
//! - Undo propagates like any other edit
//! - Comment anchors follow text moved by remote edits

use std::sync::Arc;
use std::time::Duration;

use cobrief_collab::{spawn_operation_feed, HubConfig, RealtimeHub};
use cobrief_core::{
    resolve_position, AnchorResolution, ApplyOutcome, ConflictEngine, EngineConfig, InitSource,
    Operation,
};
use tokio::task::JoinHandle;

const DOC: &str = "brief-7";

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Replica {
    engine: Arc<ConflictEngine<RealtimeHub>>,
    feed: JoinHandle<()>,
}

impl Drop for Replica {
    fn drop(&mut self) {
        self.feed.abort();
    }
}

async fn open(hub: &Arc<RealtimeHub>, participant: &str) -> Replica {
    let engine = Arc::new(ConflictEngine::with_config(
        participant,
        hub.clone(),
        EngineConfig::for_testing(),
    ));
    let events = hub.subscribe(DOC).await.unwrap();
    let feed = spawn_operation_feed(engine.clone(), events);
    assert_eq!(
        engine.initialize_document(DOC).await.unwrap(),
        InitSource::Snapshot
    );
    Replica { engine, feed }
}

fn content(replica: &Replica) -> String {
    replica.engine.get_document_state().unwrap().content
}

/// Wait until every replica and the hub agree, then return the content.
async fn converged(hub: &RealtimeHub, replicas: &[&Replica]) -> String {
    for _ in 0..100 {
        let hub_content = hub.content(DOC).await.unwrap_or_default();
        if replicas.iter().all(|r| content(r) == hub_content) {
            return hub_content;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "replicas diverged: hub={:?} replicas={:?}",
        hub.content(DOC).await,
        replicas.iter().map(|r| content(r)).collect::<Vec<_>>()
    );
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
    hub.create_document(DOC, "Hello").await.unwrap();
    let alice = open(&hub, "alice").await;
    let bob = open(&hub, "bob").await;

    let (a, b) = tokio::join!(
        alice
            .engine
            .apply_operation(Operation::insert(DOC, "alice", 5, " world")),
        bob.engine
            .apply_operation(Operation::insert(DOC, "bob", 0, ">> ")),
    );
    assert_eq!(a, ApplyOutcome::Synced);
    assert_eq!(b, ApplyOutcome::Synced);

    let text = converged(&hub, &[&alice, &bob]).await;
    assert_eq!(text, ">> Hello world");
    assert_eq!(hub.operations(DOC).await.len(), 2);

    let metrics = alice.engine.get_metrics();
    assert_eq!(metrics.operations_applied, 1);
    assert!(metrics.conflicts_resolved >= 1);
    let state = alice.engine.get_document_state().unwrap();
    assert!(state.participants.contains("bob"));
}

#[tokio::test]
async fn test_offline_publish_rides_with_next() {
    let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
    hub.create_document(DOC, "abc").await.unwrap();
    let alice = open(&hub, "alice").await;
    let bob = open(&hub, "bob").await;

    hub.set_offline(true);
    let outcome = alice
        .engine
        .apply_operation(Operation::insert(DOC, "alice", 3, "d"))
        .await;
    assert_eq!(outcome, ApplyOutcome::PendingSync);
    assert_eq!(content(&alice), "abcd");
    assert_eq!(content(&bob), "abc");

    hub.set_offline(false);
    let outcome = alice
        .engine
        .apply_operation(Operation::insert(DOC, "alice", 4, "e"))
        .await;
    assert_eq!(outcome, ApplyOutcome::Synced);

    assert_eq!(converged(&hub, &[&alice, &bob]).await, "abcde");
}

#[tokio::test]
async fn test_undo_propagates() {
    let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
    hub.create_document(DOC, "draft").await.unwrap();
    let alice = open(&hub, "alice").await;
    let bob = open(&hub, "bob").await;

    alice
        .engine
        .apply_operation(Operation::insert(DOC, "alice", 5, " v2"))
        .await;
    converged(&hub, &[&alice, &bob]).await;
    bob.engine
        .apply_operation(Operation::insert(DOC, "bob", 0, "# "))
        .await;
    assert_eq!(converged(&hub, &[&alice, &bob]).await, "# draft v2");

    assert!(alice.engine.undo().await);
    assert_eq!(converged(&hub, &[&alice, &bob]).await, "# draft");
    assert!(alice.engine.redo().await);
    assert_eq!(converged(&hub, &[&alice, &bob]).await, "# draft v2");
}

#[tokio::test]
async fn test_late_joiner_loads_merged_history() {
    let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
    hub.create_document(DOC, "one").await.unwrap();
    let alice = open(&hub, "alice").await;
    alice
        .engine
        .apply_operation(Operation::insert(DOC, "alice", 3, " two"))
        .await;

    let carol = open(&hub, "carol").await;
    assert_eq!(content(&carol), "one two");

    carol
        .engine
        .apply_operation(Operation::insert(DOC, "carol", 7, " three"))
        .await;
    assert_eq!(converged(&hub, &[&alice, &carol]).await, "one two three");
}

#[tokio::test]
async fn test_anchor_follows_remote_edits() {
    let hub = Arc::new(RealtimeHub::new(HubConfig::for_testing()));
    hub.create_document(DOC, "The quick brown fox").await.unwrap();
    let alice = open(&hub, "alice").await;
    let bob = open(&hub, "bob").await;

    // Comment on "brown" recorded against the original text.
    bob.engine
        .apply_operation(Operation::insert(DOC, "bob", 0, "Intro. "))
        .await;
    let text = converged(&hub, &[&alice, &bob]).await;

    let resolution = resolve_position(10, 15, "brown", &text);
    let (start, end) = resolution.range().unwrap();
    assert_eq!(&text.chars().skip(start).take(end - start).collect::<String>(), "brown");

    alice
        .engine
        .apply_operation(Operation::delete(DOC, "alice", 17, 6))
        .await;
    let text = converged(&hub, &[&alice, &bob]).await;
    assert_eq!(text, "Intro. The quick fox");
    assert_eq!(resolve_position(start as i64, end as i64, "brown", &text), AnchorResolution::Drifted);
}
