//! Session orchestration: the state machine tying ingest, coalescing,
//! rate limiting, dispatch, and the offline queue together.
//!
//! One [`SyncOrchestrator`] owns one document's pipeline. Construction
//! wires the bounded channels; callers take the handles they need
//! (`submitter`, `status_receiver`, `replay_receiver`, `state_receiver`,
//! `cancellation`) before spawning [`SyncOrchestrator::run`] onto the
//! runtime. The run task is the single writer for the queue and the
//! session state; everything else talks to it over channels.

mod run;
pub mod types;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::segment::{IncrementalSegment, ReplayRequest};
use crate::storage::traits::{DocumentStore, StateError, StateStore, StoreError, TokenProvider};

pub use types::{StatusEvent, StatusKind, SyncMode, SyncSessionState};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The local state store failed; the session cannot guarantee
    /// durability and refuses to start
    #[error(transparent)]
    State(#[from] StateError),
    /// The target document is missing or forbidden; retrying cannot help
    #[error("session startup rejected by document store: {0}")]
    Startup(StoreError),
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    doc_store: Arc<dyn DocumentStore>,
    tokens: Arc<dyn TokenProvider>,
    state_store: Arc<dyn StateStore>,

    ingest_tx: mpsc::Sender<IncrementalSegment>,
    ingest_rx: mpsc::Receiver<IncrementalSegment>,
    status_tx: mpsc::Sender<StatusEvent>,
    status_rx: Option<mpsc::Receiver<StatusEvent>>,
    replay_tx: mpsc::Sender<ReplayRequest>,
    replay_rx: Option<mpsc::Receiver<ReplayRequest>>,
    state_tx: watch::Sender<SyncSessionState>,
    cancel: CancellationToken,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        doc_store: Arc<dyn DocumentStore>,
        tokens: Arc<dyn TokenProvider>,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        let (ingest_tx, ingest_rx) = mpsc::channel(config.ingest_channel_capacity);
        let (status_tx, status_rx) = mpsc::channel(config.status_channel_capacity);
        let (replay_tx, replay_rx) = mpsc::channel(config.status_channel_capacity);
        let (state_tx, _) = watch::channel(SyncSessionState::default());

        Self {
            config,
            doc_store,
            tokens,
            state_store,
            ingest_tx,
            ingest_rx,
            status_tx,
            status_rx: Some(status_rx),
            replay_tx,
            replay_rx: Some(replay_rx),
            state_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Sender for the inbound segment stream. Clonable; backpressure via
    /// the bounded channel.
    pub fn submitter(&self) -> mpsc::Sender<IncrementalSegment> {
        self.ingest_tx.clone()
    }

    /// Take the outbound status stream. Yields `None` after the first call.
    pub fn status_receiver(&mut self) -> Option<mpsc::Receiver<StatusEvent>> {
        self.status_rx.take()
    }

    /// Take the replay-request stream (bounded re-delivery asks toward the
    /// producer after a detected gap). Yields `None` after the first call.
    pub fn replay_receiver(&mut self) -> Option<mpsc::Receiver<ReplayRequest>> {
        self.replay_rx.take()
    }

    /// Watch handle over the session state (mode, queue depth, last error).
    pub fn state_receiver(&self) -> watch::Receiver<SyncSessionState> {
        self.state_tx.subscribe()
    }

    /// Current session state snapshot, without subscribing.
    pub fn session_state(&self) -> SyncSessionState {
        self.state_tx.borrow().clone()
    }

    /// Token that stops the session. Cancelling aborts in-flight rate and
    /// backoff waits; queued-but-undelivered segments stay in the durable
    /// queue for the next session.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
