//! The session run loop.
//!
//! A single task owns the queue, the sequencer, the coalescer, and the
//! anchor cache; every other component talks to it over channels. No store
//! round-trip ever happens while queue state is being mutated, so
//! cancellation at any await point leaves the durable queue consistent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::types::{StatusEvent, StatusKind, SyncMode, SyncSessionState};
use super::{OrchestratorError, SyncOrchestrator};
use crate::anchor::SyncAnchor;
use crate::coalescer::{BatchCoalescer, CoalesceConfig, FlushBatch, FlushReason};
use crate::config::SyncConfig;
use crate::queue::{OfflineQueue, QueueError, Watermark};
use crate::resilience::rate_limit::RateLimiter;
use crate::resilience::retry::{retry_classified, RetryConfig, RetryError};
use crate::segment::{epoch_millis, IncrementalSegment, QueueItem, ReplayRequest};
use crate::sequencer::{Admission, IngestSequencer};
use crate::storage::traits::{
    DocumentSnapshot, DocumentStore, FailureKind, StateError, StateStore, StoreError, TokenProvider,
};
use crate::writer::{OptimisticWriter, WriteError, WriteOutcome};

impl SyncOrchestrator {
    /// Run the session to completion.
    ///
    /// Returns when the cancellation token fires, the producer drops its
    /// sender, or a fatal startup/durability error occurs. Queued but
    /// undelivered segments stay in the durable queue either way.
    #[tracing::instrument(skip(self), fields(document_id = %self.config.document_id))]
    pub async fn run(self) -> Result<(), OrchestratorError> {
        let SyncOrchestrator {
            config,
            doc_store,
            tokens,
            state_store,
            ingest_tx,
            mut ingest_rx,
            status_tx,
            replay_tx,
            state_tx,
            cancel,
            ..
        } = self;
        // Drop our own sender so recv() ends once external producers do
        drop(ingest_tx);

        let mut runner = Runner::start(
            config, doc_store, tokens, state_store, status_tx, replay_tx, state_tx, cancel,
        )
        .await?;

        let mut flush_tick = interval(Duration::from_millis(
            (runner.config.coalesce_window_ms / 4).max(50),
        ));
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut probe_tick = interval(Duration::from_millis(runner.config.probe_interval_ms.max(100)));
        probe_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = runner.cancel.cancelled() => {
                    info!(document_id = %runner.document_id, "Sync session cancelled");
                    break;
                }
                maybe_segment = ingest_rx.recv() => match maybe_segment {
                    Some(segment) => runner.on_segment(segment).await?,
                    None => {
                        info!(document_id = %runner.document_id, "Segment producer closed, stopping session");
                        break;
                    }
                },
                _ = flush_tick.tick() => {
                    if runner.live_path_open() {
                        if let Some(batch) = runner.coalescer.take_if_ready() {
                            runner.dispatch_live(batch).await?;
                        }
                    }
                }
                _ = probe_tick.tick() => match runner.mode {
                    SyncMode::Offline => runner.probe_and_resync().await?,
                    SyncMode::Online if !runner.queue.is_empty() => runner.drain_queue().await?,
                    _ => {}
                },
            }
        }

        runner.shutdown().await?;
        Ok(())
    }
}

struct Runner {
    config: SyncConfig,
    document_id: String,
    mode: SyncMode,
    /// Session id of the most recently seen segment, stamped onto status events
    session_id: String,

    writer: OptimisticWriter,
    limiter: RateLimiter,
    queue: OfflineQueue,
    sequencer: IngestSequencer,
    coalescer: BatchCoalescer,
    dispatch_retry: RetryConfig,

    /// Last-known anchor; trusted until the store reports a conflict
    anchor: Option<SyncAnchor>,
    /// Highest dispatched sequence id per session, persisted as `acks/{doc}`
    acked: HashMap<String, u64>,

    doc_store: Arc<dyn DocumentStore>,
    tokens: Arc<dyn TokenProvider>,
    state_store: Arc<dyn StateStore>,
    status_tx: mpsc::Sender<StatusEvent>,
    replay_tx: mpsc::Sender<ReplayRequest>,
    state_tx: watch::Sender<SyncSessionState>,
    cancel: CancellationToken,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    async fn start(
        config: SyncConfig,
        doc_store: Arc<dyn DocumentStore>,
        tokens: Arc<dyn TokenProvider>,
        state_store: Arc<dyn StateStore>,
        status_tx: mpsc::Sender<StatusEvent>,
        replay_tx: mpsc::Sender<ReplayRequest>,
        state_tx: watch::Sender<SyncSessionState>,
        cancel: CancellationToken,
    ) -> Result<Self, OrchestratorError> {
        let document_id = config.document_id.clone();
        info!(document_id = %document_id, "Starting sync session");

        let queue = OfflineQueue::open(
            state_store.clone(),
            &document_id,
            config.queue_capacity,
            config.queue_warn_ratio,
            config.queue_retry_limit,
        )
        .await?;

        let acked = load_acks(&*state_store, &document_id).await?;
        // Seed watermarks with queued-but-undelivered items too, so their
        // duplicates are dropped on re-delivery
        let mut watermarks = acked.clone();
        for item in queue.iter() {
            let entry = watermarks.entry(item.segment.session_id.clone()).or_insert(0);
            *entry = (*entry).max(item.segment.sequence_id);
        }
        let sequencer = IngestSequencer::with_acknowledged(config.replay_window, watermarks);

        let anchor = load_anchor(&*state_store, &document_id).await?;

        let writer = OptimisticWriter::new(
            doc_store.clone(),
            tokens.clone(),
            config.conflict_retry_limit,
            Duration::from_millis(config.store_deadline_ms),
        );
        let limiter = RateLimiter::new(config.rate_capacity, config.rate_refill_per_sec);
        let coalescer = BatchCoalescer::new(CoalesceConfig {
            window_ms: config.coalesce_window_ms,
            max_chars: config.coalesce_chars,
            max_count: config.coalesce_count,
        });

        let mut runner = Self {
            document_id,
            mode: SyncMode::Stopped,
            session_id: String::new(),
            writer,
            limiter,
            queue,
            sequencer,
            coalescer,
            dispatch_retry: RetryConfig::dispatch(),
            anchor,
            acked,
            doc_store,
            tokens,
            state_store,
            status_tx,
            replay_tx,
            state_tx,
            cancel,
            config,
        };

        runner.set_mode(SyncMode::Starting);
        runner.emit(StatusKind::SyncStarted, None);

        // Establish connectivity and the anchor before accepting segments.
        // A missing or forbidden document is fatal; anything else just
        // starts the session offline.
        match runner.probe_store().await {
            Ok(snapshot) => {
                if runner.anchor.is_none() {
                    runner.derive_anchor(&snapshot).await?;
                }
                if runner.queue.is_empty() {
                    runner.set_mode(SyncMode::Online);
                    runner.emit(StatusKind::SyncOnline, None);
                } else {
                    // Leftovers from a previous session drain first
                    runner.drain_queue().await?;
                }
            }
            Err(e) if e.kind() == FailureKind::Terminal => {
                error!(document_id = %runner.document_id, error = %e, "Target document unusable");
                return Err(OrchestratorError::Startup(e));
            }
            Err(e) => {
                warn!(document_id = %runner.document_id, error = %e, "Store unreachable at startup, queueing locally");
                runner.set_mode(SyncMode::Offline);
                runner.emit(StatusKind::SyncOffline, Some(e.to_string()));
            }
        }

        Ok(runner)
    }

    async fn on_segment(&mut self, segment: IncrementalSegment) -> Result<(), StateError> {
        if segment.is_partial {
            trace!(sequence_id = segment.sequence_id, "Ignoring partial segment");
            return Ok(());
        }
        self.session_id = segment.session_id.clone();
        let prior_watermark = self.sequencer.last_accepted(&segment.session_id);

        match self.sequencer.accept(&segment) {
            Admission::Duplicate => {
                crate::metrics::record_segment_duplicate(&segment.session_id);
                return Ok(());
            }
            Admission::GapDetected { expected, replay } => {
                crate::metrics::record_sequence_gap(&segment.session_id, replay.is_some());
                warn!(
                    session_id = %segment.session_id,
                    expected,
                    got = segment.sequence_id,
                    replay = replay.is_some(),
                    "Sequence gap on ingest"
                );
                if let Some(request) = replay {
                    if self.replay_tx.try_send(request).is_err() {
                        warn!("Replay channel full or closed, dropping replay request");
                    }
                }
            }
            Admission::Accepted => {
                crate::metrics::record_segment_accepted(&segment.session_id);
            }
        }

        // Never merge a batch across a gap or a session change
        if !self.coalescer.continues_run(&segment) {
            if let Some(batch) = self.coalescer.force_flush_with_reason(FlushReason::Gap) {
                self.handle_batch(batch).await?;
            }
        }

        if self.live_path_open() {
            if let Some(reason) = self.coalescer.add(segment) {
                if let Some(batch) = self.coalescer.force_flush_with_reason(reason) {
                    self.dispatch_live(batch).await?;
                }
            }
        } else if !self.enqueue_segment(segment).await? {
            // Rejected at capacity: the id must stay admissible so a
            // producer redelivery after the queue drains is not dropped
            // as a duplicate
            let session = self.session_id.clone();
            self.sequencer.restore(&session, prior_watermark);
        }
        Ok(())
    }

    /// Whether a batch may dispatch directly. Anything in the durable queue
    /// is older than the coalescer's pending run, so live dispatch while the
    /// queue is non-empty would reorder a session's segments; such batches
    /// join the back of the queue instead and drain in order.
    fn live_path_open(&self) -> bool {
        self.mode == SyncMode::Online && self.queue.is_empty()
    }

    async fn handle_batch(&mut self, batch: FlushBatch) -> Result<(), StateError> {
        if self.live_path_open() {
            self.dispatch_live(batch).await
        } else {
            self.spill(batch).await
        }
    }

    /// Push a live segment into the durable queue, surfacing watermark
    /// crossings and fail-fast overflow. Returns `false` when the segment
    /// was rejected at capacity.
    async fn enqueue_segment(&mut self, segment: IncrementalSegment) -> Result<bool, StateError> {
        let sequence_id = segment.sequence_id;
        match self.queue.enqueue(segment).await {
            Ok(()) => {}
            Err(QueueError::Full { capacity }) => {
                error!(sequence_id, capacity, "Offline queue full, segment rejected");
                self.emit(
                    StatusKind::SyncError,
                    Some(format!("offline queue full ({capacity} items), segment {sequence_id} rejected")),
                );
                return Ok(false);
            }
            Err(QueueError::State(e)) => return Err(e),
        }
        self.after_queue_mutation();
        Ok(true)
    }

    /// Return an undispatched batch to the durable queue.
    async fn spill(&mut self, batch: FlushBatch) -> Result<(), StateError> {
        for segment in batch.segments {
            self.enqueue_segment(segment).await?;
        }
        Ok(())
    }

    fn after_queue_mutation(&mut self) {
        if let Some(crossed) = self.queue.poll_watermark() {
            match crossed {
                Watermark::Warning => {
                    let depth = self.queue.depth();
                    warn!(depth, "Offline queue reached warning watermark");
                    self.emit(
                        StatusKind::SyncError,
                        Some(format!("offline queue at warning watermark ({depth} items)")),
                    );
                }
                Watermark::Full => {
                    self.emit(StatusKind::SyncError, Some("offline queue full".to_string()));
                }
                Watermark::Normal => {}
            }
        }
        self.publish_state();
    }

    /// Dispatch a coalesced batch of live segments.
    async fn dispatch_live(&mut self, batch: FlushBatch) -> Result<(), StateError> {
        crate::metrics::record_batch_flush(batch.reason.as_str(), batch.segments.len(), batch.total_chars);
        let batch_id = uuid::Uuid::new_v4().to_string();
        debug!(
            batch_id = %batch_id,
            segments = batch.segments.len(),
            chars = batch.total_chars,
            reason = batch.reason.as_str(),
            "Dispatching batch"
        );

        tokio::select! {
            _ = self.cancel.cancelled() => return self.spill(batch).await,
            _ = self.limiter.acquire() => {}
        }

        let started = Instant::now();
        let outcome = self.guarded_write(&batch.text()).await;
        match outcome {
            Ok(out) => {
                crate::metrics::record_dispatch("success", started.elapsed());
                self.record_success(out, &batch.segments).await
            }
            Err(RetryError::Cancelled) => self.spill(batch).await,
            Err(RetryError::Exhausted(e)) => {
                crate::metrics::record_dispatch("requeued", started.elapsed());
                warn!(error = %e, "Dispatch retries exhausted, returning batch to queue");
                self.spill(batch).await?;
                self.emit(StatusKind::SyncError, Some(format!("write retries exhausted: {e}")));
                Ok(())
            }
            Err(RetryError::Terminal(e)) => {
                crate::metrics::record_dispatch("failed", started.elapsed());
                self.on_dispatch_failure(batch, e).await
            }
        }
    }

    /// The shared write path: classified retry around the optimistic
    /// writer, retrying only quota-class failures. Connectivity failures
    /// return immediately so the offline transition is prompt.
    async fn guarded_write(&self, text: &str) -> Result<WriteOutcome, RetryError<WriteError>> {
        let writer = &self.writer;
        let document_id = &self.document_id;
        let anchor = self.anchor.clone();
        retry_classified(
            "dispatch_write",
            &self.dispatch_retry,
            &self.cancel,
            |e: &WriteError| matches!(e, WriteError::Store(s) if s.kind() == FailureKind::Quota),
            || writer.write(document_id, text, anchor.as_ref()),
        )
        .await
    }

    async fn record_success(
        &mut self,
        outcome: WriteOutcome,
        segments: &[IncrementalSegment],
    ) -> Result<(), StateError> {
        debug!(
            document_id = %self.document_id,
            segments = segments.len(),
            position = outcome.anchor.position,
            "Batch dispatched"
        );
        self.anchor = Some(outcome.anchor);
        self.persist_anchor().await?;

        for segment in segments {
            let entry = self.acked.entry(segment.session_id.clone()).or_insert(0);
            *entry = (*entry).max(segment.sequence_id);
        }
        self.persist_acks().await?;

        self.state_tx.send_modify(|s| {
            s.last_synced_at = Some(epoch_millis());
            s.last_error = None;
        });
        self.publish_state();

        if let Some(path) = outcome.recovered {
            self.emit(
                StatusKind::SyncError,
                Some(format!("insertion point was reset ({path})")),
            );
        }
        self.emit(StatusKind::SyncSuccess, None);
        Ok(())
    }

    async fn on_dispatch_failure(
        &mut self,
        batch: FlushBatch,
        failure: WriteError,
    ) -> Result<(), StateError> {
        match failure {
            WriteError::ConflictExceeded { attempts } => {
                warn!(attempts, "Batch lost the conditional write repeatedly, requeueing");
                self.spill(batch).await?;
                self.emit(
                    StatusKind::SyncError,
                    Some(format!("write conflicted {attempts} times, batch requeued")),
                );
                Ok(())
            }
            WriteError::Auth(e) => {
                warn!(error = %e, "Credential unavailable, pausing dispatch");
                self.spill(batch).await?;
                self.go_offline(e.to_string());
                Ok(())
            }
            WriteError::Store(e) => match e.kind() {
                FailureKind::Connectivity | FailureKind::Credential => {
                    warn!(error = %e, "Store unreachable, going offline");
                    self.spill(batch).await?;
                    self.go_offline(e.to_string());
                    Ok(())
                }
                FailureKind::Terminal => {
                    error!(error = %e, segments = batch.segments.len(), "Terminal store failure, dead-lettering batch");
                    for segment in batch.segments {
                        self.queue.dead_letter(QueueItem::new(segment), &e.to_string()).await?;
                    }
                    self.publish_state();
                    self.emit(StatusKind::SyncError, Some(e.to_string()));
                    Ok(())
                }
                // Quota is retried inside guarded_write; Conflict inside
                // the writer. Anything that still lands here is requeued.
                FailureKind::Quota | FailureKind::Conflict => {
                    self.spill(batch).await?;
                    self.emit(StatusKind::SyncError, Some(e.to_string()));
                    Ok(())
                }
            },
        }
    }

    fn go_offline(&mut self, reason: String) {
        self.set_mode(SyncMode::Offline);
        self.emit(StatusKind::SyncOffline, Some(reason));
    }

    /// One connectivity probe while offline; on success, drain the queue.
    async fn probe_and_resync(&mut self) -> Result<(), StateError> {
        match self.probe_store().await {
            Ok(snapshot) => {
                crate::metrics::record_probe(true);
                info!(document_id = %self.document_id, "Connectivity restored");
                if self.anchor.is_none() {
                    self.derive_anchor(&snapshot).await?;
                }
                self.drain_queue().await
            }
            Err(e) => {
                crate::metrics::record_probe(false);
                debug!(error = %e, "Probe failed, staying offline");
                Ok(())
            }
        }
    }

    /// Drain the offline queue oldest-first through the same rate-limited
    /// write path as live traffic, bounded by the resync budget. Remaining
    /// items stay queued for the next cycle.
    #[tracing::instrument(skip(self), fields(depth = self.queue.depth()))]
    async fn drain_queue(&mut self) -> Result<(), StateError> {
        if self.queue.is_empty() {
            if self.mode != SyncMode::Online {
                self.set_mode(SyncMode::Online);
                self.emit(StatusKind::SyncOnline, None);
            }
            return Ok(());
        }

        self.set_mode(SyncMode::Resyncing);
        let deadline = Instant::now() + Duration::from_millis(self.config.resync_max_ms);
        let mut drained = 0usize;

        while !self.queue.is_empty()
            && drained < self.config.resync_max_items
            && Instant::now() < deadline
        {
            let items = self.queue.peek_batch(self.config.coalesce_count, self.config.coalesce_chars);
            if items.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = self.limiter.acquire() => {}
            }

            let batch_id = uuid::Uuid::new_v4().to_string();
            debug!(batch_id = %batch_id, items = items.len(), "Resync batch");
            let text = join_items(&items);
            let started = Instant::now();
            match self.guarded_write(&text).await {
                Ok(outcome) => {
                    crate::metrics::record_dispatch("success", started.elapsed());
                    self.remove_items(&items).await?;
                    drained += items.len();
                    let segments: Vec<IncrementalSegment> =
                        items.into_iter().map(|i| i.segment).collect();
                    self.record_success(outcome, &segments).await?;
                }
                Err(RetryError::Cancelled) => return Ok(()),
                Err(RetryError::Exhausted(e)) => {
                    crate::metrics::record_dispatch("requeued", started.elapsed());
                    self.requeue_with_bump(items, &e.to_string()).await?;
                    self.emit(StatusKind::SyncError, Some(format!("resync write failed: {e}")));
                    break;
                }
                Err(RetryError::Terminal(WriteError::ConflictExceeded { attempts })) => {
                    crate::metrics::record_dispatch("requeued", started.elapsed());
                    self.requeue_with_bump(items, &format!("conflicted {attempts} times")).await?;
                    self.emit(
                        StatusKind::SyncError,
                        Some(format!("write conflicted {attempts} times, batch requeued")),
                    );
                    break;
                }
                Err(RetryError::Terminal(WriteError::Auth(e))) => {
                    crate::metrics::record_dispatch("failed", started.elapsed());
                    self.go_offline(e.to_string());
                    return Ok(());
                }
                Err(RetryError::Terminal(WriteError::Store(e))) => match e.kind() {
                    FailureKind::Connectivity | FailureKind::Credential => {
                        crate::metrics::record_dispatch("failed", started.elapsed());
                        self.go_offline(e.to_string());
                        return Ok(());
                    }
                    FailureKind::Terminal => {
                        crate::metrics::record_dispatch("failed", started.elapsed());
                        error!(error = %e, "Terminal failure during resync, dead-lettering batch");
                        self.remove_items(&items).await?;
                        for item in items {
                            self.queue.dead_letter(item, &e.to_string()).await?;
                        }
                        self.publish_state();
                        self.emit(StatusKind::SyncError, Some(e.to_string()));
                    }
                    _ => {
                        crate::metrics::record_dispatch("requeued", started.elapsed());
                        self.requeue_with_bump(items, &e.to_string()).await?;
                        break;
                    }
                },
            }
        }

        if self.mode == SyncMode::Resyncing {
            if !self.queue.is_empty() {
                debug!(
                    remaining = self.queue.depth(),
                    drained, "Resync budget spent, remaining items stay queued"
                );
            }
            self.set_mode(SyncMode::Online);
            self.emit(StatusKind::SyncOnline, None);
        }
        Ok(())
    }

    /// Remove items then push them back with bumped retry counts; items
    /// past the retry limit move to the dead-letter list.
    async fn requeue_with_bump(
        &mut self,
        items: Vec<QueueItem>,
        error: &str,
    ) -> Result<(), StateError> {
        self.remove_items(&items).await?;
        let dead = self.queue.requeue_failed(items, error).await?;
        for letter in &dead {
            self.emit(
                StatusKind::SyncError,
                Some(format!(
                    "segment {} abandoned after {} attempts: {}",
                    letter.segment.sequence_id, letter.attempts, letter.error
                )),
            );
        }
        self.publish_state();
        Ok(())
    }

    async fn remove_items(&mut self, items: &[QueueItem]) -> Result<(), StateError> {
        let mut by_session: HashMap<&str, Vec<u64>> = HashMap::new();
        for item in items {
            by_session
                .entry(item.segment.session_id.as_str())
                .or_default()
                .push(item.segment.sequence_id);
        }
        for (session, ids) in by_session {
            self.queue.ack(session, &ids).await?;
        }
        Ok(())
    }

    /// Snapshot the document within the call deadline, mapping credential
    /// unavailability onto the same taxonomy as store rejections.
    async fn probe_store(&self) -> Result<DocumentSnapshot, StoreError> {
        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|_| StoreError::CredentialRejected)?;
        let deadline = Duration::from_millis(self.config.store_deadline_ms);
        match tokio::time::timeout(deadline, self.doc_store.snapshot(&token, &self.document_id))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(deadline)),
        }
    }

    /// Derive and persist an anchor from a fresh snapshot. Used at first
    /// start and after an external deletion noticed while probing.
    async fn derive_anchor(&mut self, snapshot: &DocumentSnapshot) -> Result<(), StateError> {
        let anchor = match snapshot.anchor.clone() {
            Some(existing) => existing,
            None => {
                let (position, path) =
                    crate::anchor::AnchorRecoveryStrategy::locate(&self.document_id, snapshot);
                debug!(position, path = %path, "Derived anchor from snapshot");
                SyncAnchor::new(&self.document_id, position, snapshot.revision_token.clone())
            }
        };
        self.anchor = Some(anchor);
        self.persist_anchor().await
    }

    async fn persist_anchor(&self) -> Result<(), StateError> {
        if let Some(anchor) = &self.anchor {
            let json = serde_json::to_string(anchor)
                .map_err(|e| StateError::Backend(e.to_string()))?;
            self.state_store
                .replace(&format!("anchor/{}", self.document_id), &json)
                .await?;
        }
        Ok(())
    }

    async fn persist_acks(&self) -> Result<(), StateError> {
        let json = serde_json::to_string(&self.acked)
            .map_err(|e| StateError::Backend(e.to_string()))?;
        self.state_store
            .replace(&format!("acks/{}", self.document_id), &json)
            .await
    }

    /// Spill any pending coalesced segments into the durable queue and
    /// persist final state. No further batches are dispatched.
    async fn shutdown(&mut self) -> Result<(), StateError> {
        if let Some(batch) = self.coalescer.force_flush_with_reason(FlushReason::Shutdown) {
            info!(segments = batch.segments.len(), "Spilling pending batch to queue on shutdown");
            self.spill(batch).await?;
        }
        self.persist_acks().await?;
        self.persist_anchor().await?;
        self.set_mode(SyncMode::Stopped);
        info!(
            document_id = %self.document_id,
            queue_depth = self.queue.depth(),
            "Sync session stopped"
        );
        Ok(())
    }

    fn set_mode(&mut self, to: SyncMode) {
        if self.mode == to {
            return;
        }
        crate::metrics::record_mode_transition(self.mode.as_str(), to.as_str());
        info!(document_id = %self.document_id, from = %self.mode, to = %to, "Mode transition");
        self.mode = to;
        self.publish_state();
    }

    fn publish_state(&self) {
        let mode = self.mode;
        let depth = self.queue.depth();
        let dead = self.queue.dead_letters().len();
        crate::metrics::set_queue_depth(depth);
        self.state_tx.send_modify(|s| {
            s.mode = mode;
            s.queue_depth = depth;
            s.dead_letters = dead;
        });
    }

    /// Emit a status event. Observational only: a full or unclaimed status
    /// channel never blocks dispatch. A pending sequence discontinuity
    /// rides along on the next event emitted, whatever its kind.
    fn emit(&mut self, kind: StatusKind, error: Option<String>) {
        if let Some(msg) = &error {
            self.state_tx.send_modify(|s| s.last_error = Some(msg.clone()));
        }
        let event = StatusEvent {
            kind,
            session_id: self.session_id.clone(),
            queue_depth: Some(self.queue.depth()),
            error,
            discontinuity: self.sequencer.take_discontinuity(),
        };
        if self.status_tx.try_send(event).is_err() && !self.status_tx.is_closed() {
            debug!("Status channel full, event dropped");
        }
    }
}

fn join_items(items: &[QueueItem]) -> String {
    let mut out = String::new();
    for item in items {
        out.push_str(&item.segment.text);
        out.push(' ');
    }
    out
}

async fn load_acks(
    store: &dyn StateStore,
    document_id: &str,
) -> Result<HashMap<String, u64>, StateError> {
    let key = format!("acks/{document_id}");
    match store.load(&key).await? {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| StateError::Corrupt {
            key,
            reason: e.to_string(),
        }),
        None => Ok(HashMap::new()),
    }
}

async fn load_anchor(
    store: &dyn StateStore,
    document_id: &str,
) -> Result<Option<SyncAnchor>, StateError> {
    let key = format!("anchor/{document_id}");
    match store.load(&key).await? {
        Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| StateError::Corrupt {
            key,
            reason: e.to_string(),
        }),
        None => Ok(None),
    }
}
