//! # Transcript Sync
//!
//! A reconciliation core that mirrors an ordered stream of finalized
//! transcript segments into an external collaborative document, surviving
//! connectivity loss, write quotas, and concurrent edits without losing or
//! reordering data.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Ingest Layer                          │
//! │  • Bounded channel of IncrementalSegments                   │
//! │  • IngestSequencer: per-session monotonic admission,        │
//! │    duplicate drop, bounded replay requests on gaps          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      BatchCoalescer                         │
//! │  • Flush on time window, char budget, or segment count      │
//! │  • Never merges across a sequence gap                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              (RateLimiter + classified backoff retry)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     OptimisticWriter                        │
//! │  • Revision-guarded conditional writes                      │
//! │  • Anchor recovery on conflict, bounded attempts            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │                │ (failure)
//!                              ▼                ▼
//! ┌──────────────────────────────┐ ┌──────────────────────────────┐
//! │  External document store     │ │  OfflineQueue (durable)      │
//! │  (REST, conditional writes)  │ │  • Survives restarts         │
//! │                              │ │  • Watermark warnings        │
//! │                              │ │  • Dead letters              │
//! └──────────────────────────────┘ └──────────────────────────────┘
//! ```
//!
//! The [`orchestrator::SyncOrchestrator`] ties the pieces together as a
//! state machine (`Stopped → Starting → Online ⇄ Offline → Resyncing →
//! Online`). One orchestrator instance owns one document; parallel
//! documents get parallel instances with independent rate quotas.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use transcript_sync::{IncrementalSegment, SyncConfig, SyncOrchestrator};
//! use transcript_sync::storage::memory::{MemoryDocumentStore, MemoryStateStore, StaticTokenProvider};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig {
//!         document_id: "doc-123".into(),
//!         ..Default::default()
//!     };
//!
//!     let mut orchestrator = SyncOrchestrator::new(
//!         config,
//!         Arc::new(MemoryDocumentStore::new("doc-123")),
//!         Arc::new(StaticTokenProvider::new("token")),
//!         Arc::new(MemoryStateStore::new()),
//!     );
//!
//!     let submit = orchestrator.submitter();
//!     let mut status = orchestrator.status_receiver().unwrap();
//!     let stop = orchestrator.cancellation();
//!     let session = tokio::spawn(orchestrator.run());
//!
//!     submit
//!         .send(IncrementalSegment::finalized("session-1", 1, "hello world"))
//!         .await
//!         .unwrap();
//!     if let Some(event) = status.recv().await {
//!         println!("status: {:?}", event.kind);
//!     }
//!
//!     stop.cancel();
//!     session.await.unwrap().unwrap();
//! }
//! ```

pub mod anchor;
pub mod coalescer;
pub mod config;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod resilience;
pub mod segment;
pub mod sequencer;
pub mod storage;
pub mod writer;

pub use anchor::{AnchorRecoveryStrategy, RecoveryPath, SyncAnchor};
pub use coalescer::{BatchCoalescer, CoalesceConfig, FlushBatch, FlushReason};
pub use config::SyncConfig;
pub use orchestrator::{
    OrchestratorError, StatusEvent, StatusKind, SyncMode, SyncOrchestrator, SyncSessionState,
};
pub use queue::{OfflineQueue, QueueError, Watermark};
pub use resilience::rate_limit::RateLimiter;
pub use resilience::retry::{retry, retry_classified, RetryConfig, RetryError};
pub use segment::{DeadLetter, IncrementalSegment, QueueItem, ReplayRequest};
pub use sequencer::{Admission, IngestSequencer};
pub use storage::traits::{
    AccessToken, AuthUnavailable, DocumentSnapshot, DocumentStore, FailureKind, StateError,
    StateStore, StoreError, TokenProvider, WriteOp, WriteReceipt, WriteRequest,
};
pub use writer::{OptimisticWriter, WriteError, WriteOutcome};
