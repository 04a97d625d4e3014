//! Failure-injection tests.
//!
//! Wraps the in-memory document store with call-count-precise error
//! injection to exercise the orchestrator's failure reactions: terminal
//! errors dead-letter, credential loss pauses, flaky connectivity bounces
//! through offline/resync, and corrupt persisted state refuses to start.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use transcript_sync::storage::memory::{
    MemoryDocumentStore, MemoryStateStore, StaticTokenProvider,
};
use transcript_sync::storage::traits::{
    AccessToken, DocumentSnapshot, DocumentStore, StateStore, StoreError, WriteReceipt,
    WriteRequest,
};
use transcript_sync::{
    IncrementalSegment, OrchestratorError, StateError, SyncConfig, SyncMode, SyncOrchestrator,
};

const WAIT: Duration = Duration::from_secs(120);

/// Injects a scripted error on specific commit call numbers (1-indexed).
struct FailingDocumentStore {
    inner: Arc<MemoryDocumentStore>,
    commit_count: AtomicU64,
    fail_on_commits: Vec<u64>,
    error: StoreError,
}

impl FailingDocumentStore {
    fn new(inner: Arc<MemoryDocumentStore>, fail_on_commits: Vec<u64>, error: StoreError) -> Self {
        Self {
            inner,
            commit_count: AtomicU64::new(0),
            fail_on_commits,
            error,
        }
    }
}

#[async_trait]
impl DocumentStore for FailingDocumentStore {
    async fn snapshot(
        &self,
        token: &AccessToken,
        document_id: &str,
    ) -> Result<DocumentSnapshot, StoreError> {
        self.inner.snapshot(token, document_id).await
    }

    async fn commit(
        &self,
        token: &AccessToken,
        document_id: &str,
        request: &WriteRequest,
    ) -> Result<WriteReceipt, StoreError> {
        let call = self.commit_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_commits.contains(&call) {
            return Err(self.error.clone());
        }
        self.inner.commit(token, document_id, request).await
    }
}

fn chaos_config(document_id: &str) -> SyncConfig {
    SyncConfig {
        document_id: document_id.into(),
        probe_interval_ms: 50,
        coalesce_window_ms: 100,
        coalesce_count: 1,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_terminal_failure_dead_letters_and_session_continues() {
    let inner = Arc::new(MemoryDocumentStore::new("doc-1"));
    // First commit is forbidden; everything after works
    let doc = Arc::new(FailingDocumentStore::new(
        inner.clone(),
        vec![1],
        StoreError::PermissionDenied("locked range".to_string()),
    ));
    let state_store = Arc::new(MemoryStateStore::new());

    let orch = SyncOrchestrator::new(
        chaos_config("doc-1"),
        doc,
        Arc::new(StaticTokenProvider::new("t")),
        state_store.clone(),
    );
    let submit = orch.submitter();
    let mut state = orch.state_receiver();
    let stop = orch.cancellation();
    let session = tokio::spawn(orch.run());

    submit
        .send(IncrementalSegment::finalized("s1", 1, "doomed"))
        .await
        .unwrap();
    timeout(WAIT, state.wait_for(|s| s.dead_letters == 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inner.body(), "");

    // The session is still online and later segments flow normally
    submit
        .send(IncrementalSegment::finalized("s1", 2, "healthy"))
        .await
        .unwrap();
    timeout(WAIT, state.wait_for(|s| s.last_synced_at.is_some()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inner.body(), "healthy ");

    // Dead letter is durably recorded with its reason
    let dead = state_store.load("dead/doc-1").await.unwrap().unwrap();
    assert!(dead.contains("doomed"));
    assert!(dead.contains("locked range"));

    stop.cancel();
    session.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_credential_loss_pauses_without_discarding_queue() {
    let doc = Arc::new(MemoryDocumentStore::new("doc-1"));
    let tokens = Arc::new(StaticTokenProvider::new("t"));
    let state_store = Arc::new(MemoryStateStore::new());

    let orch = SyncOrchestrator::new(chaos_config("doc-1"), doc.clone(), tokens.clone(), state_store);
    let submit = orch.submitter();
    let mut state = orch.state_receiver();
    let stop = orch.cancellation();
    let session = tokio::spawn(orch.run());

    timeout(WAIT, state.wait_for(|s| s.mode == SyncMode::Online))
        .await
        .unwrap()
        .unwrap();

    tokens.set_available(false);
    submit
        .send(IncrementalSegment::finalized("s1", 1, "held"))
        .await
        .unwrap();

    // Dispatch pauses; the segment waits in the durable queue
    timeout(
        WAIT,
        state.wait_for(|s| s.mode == SyncMode::Offline && s.queue_depth == 1),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(doc.body(), "");

    tokens.set_available(true);
    timeout(
        WAIT,
        state.wait_for(|s| s.mode == SyncMode::Online && s.queue_depth == 0),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(doc.body(), "held ");

    stop.cancel();
    session.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_flaky_connectivity_bounces_offline_and_recovers() {
    let doc = Arc::new(MemoryDocumentStore::new("doc-1"));
    let state_store = Arc::new(MemoryStateStore::new());

    let orch = SyncOrchestrator::new(
        chaos_config("doc-1"),
        doc.clone(),
        Arc::new(StaticTokenProvider::new("t")),
        state_store,
    );
    let submit = orch.submitter();
    let mut state = orch.state_receiver();
    let stop = orch.cancellation();
    let session = tokio::spawn(orch.run());

    timeout(WAIT, state.wait_for(|s| s.mode == SyncMode::Online))
        .await
        .unwrap()
        .unwrap();
    submit
        .send(IncrementalSegment::finalized("s1", 1, "before"))
        .await
        .unwrap();
    timeout(WAIT, state.wait_for(|s| s.last_synced_at.is_some()))
        .await
        .unwrap()
        .unwrap();

    // Network drops mid-session
    doc.set_offline(true);
    submit
        .send(IncrementalSegment::finalized("s1", 2, "during"))
        .await
        .unwrap();
    timeout(
        WAIT,
        state.wait_for(|s| s.mode == SyncMode::Offline && s.queue_depth >= 1),
    )
    .await
    .unwrap()
    .unwrap();

    doc.set_offline(false);
    timeout(
        WAIT,
        state.wait_for(|s| s.mode == SyncMode::Online && s.queue_depth == 0),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(doc.body(), "before during ");

    stop.cancel();
    session.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_queue_record_refuses_to_start() {
    let state_store = Arc::new(MemoryStateStore::new());
    state_store
        .replace("queue/doc-1", "{ not json at all")
        .await
        .unwrap();

    let orch = SyncOrchestrator::new(
        chaos_config("doc-1"),
        Arc::new(MemoryDocumentStore::new("doc-1")),
        Arc::new(StaticTokenProvider::new("t")),
        state_store,
    );
    let result = orch.run().await;

    match result {
        Err(OrchestratorError::State(StateError::Corrupt { key, .. })) => {
            assert_eq!(key, "queue/doc-1");
        }
        other => panic!("expected corrupt-state failure, got {:?}", other.err()),
    }
}

#[tokio::test(start_paused = true)]
async fn test_missing_document_is_fatal_at_startup() {
    let orch = SyncOrchestrator::new(
        chaos_config("doc-1"),
        // The store only knows a different document
        Arc::new(MemoryDocumentStore::new("some-other-doc")),
        Arc::new(StaticTokenProvider::new("t")),
        Arc::new(MemoryStateStore::new()),
    );
    let result = orch.run().await;

    assert!(matches!(
        result,
        Err(OrchestratorError::Startup(StoreError::NotFound(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_requeued_batch_drains_before_newer_live_segments() {
    let inner = Arc::new(MemoryDocumentStore::new("doc-1"));
    // Exhaust the writer's conflict attempts so the first batch requeues
    inner.inject_conflicts(3);
    let state_store = Arc::new(MemoryStateStore::new());

    let orch = SyncOrchestrator::new(
        chaos_config("doc-1"),
        inner.clone(),
        Arc::new(StaticTokenProvider::new("t")),
        state_store,
    );
    let submit = orch.submitter();
    let mut state = orch.state_receiver();
    let stop = orch.cancellation();
    let session = tokio::spawn(orch.run());

    submit
        .send(IncrementalSegment::finalized("s1", 1, "one"))
        .await
        .unwrap();
    timeout(WAIT, state.wait_for(|s| s.queue_depth == 1))
        .await
        .unwrap()
        .unwrap();

    // A newer segment while the older one is still queued must wait its
    // turn behind the queue, not dispatch directly
    submit
        .send(IncrementalSegment::finalized("s1", 2, "two"))
        .await
        .unwrap();
    timeout(
        WAIT,
        state.wait_for(|s| s.queue_depth == 0 && s.last_synced_at.is_some()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(inner.body(), "one two ", "session order must survive a requeue");

    stop.cancel();
    session.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_conflict_storm_requeues_rather_than_drops() {
    let inner = Arc::new(MemoryDocumentStore::new("doc-1"));
    // Conflict on every early commit so the writer's attempts exhaust
    inner.inject_conflicts(3);
    let state_store = Arc::new(MemoryStateStore::new());

    let orch = SyncOrchestrator::new(
        chaos_config("doc-1"),
        inner.clone(),
        Arc::new(StaticTokenProvider::new("t")),
        state_store,
    );
    let submit = orch.submitter();
    let mut state = orch.state_receiver();
    let stop = orch.cancellation();
    let session = tokio::spawn(orch.run());

    submit
        .send(IncrementalSegment::finalized("s1", 1, "contended"))
        .await
        .unwrap();

    // Three conflicts exhaust the write; the batch returns to the queue
    // and the next drain cycle (conflicts cleared) delivers it
    timeout(WAIT, state.wait_for(|s| s.queue_depth == 0 && s.last_synced_at.is_some()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inner.body(), "contended ");

    stop.cancel();
    session.await.unwrap().unwrap();
}
