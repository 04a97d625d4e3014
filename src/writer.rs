//! Conditional (revision-guarded) writes with conflict retry.
//!
//! The [`OptimisticWriter`] performs the store's batched conditional write:
//! read the current anchor and revision token, write guarded by that token,
//! and on a revision mismatch re-derive the anchor from a fresh snapshot
//! and try again, up to a bounded attempt count. The returned anchor always
//! carries the store-reported post-insert position, never a locally
//! computed character count.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::anchor::{AnchorRecoveryStrategy, RecoveryPath, SyncAnchor};
use crate::storage::traits::{
    AccessToken, AuthUnavailable, DocumentStore, StoreError, TokenProvider, WriteOp, WriteReceipt,
    WriteRequest,
};

#[derive(Error, Debug)]
pub enum WriteError {
    /// All conflict attempts exhausted; the caller re-enqueues the batch
    #[error("conditional write lost {attempts} consecutive revision conflicts")]
    ConflictExceeded { attempts: u32 },
    /// No credential available; dispatch pauses without discarding anything
    #[error(transparent)]
    Auth(#[from] AuthUnavailable),
    /// Any non-conflict store failure, classification intact
    #[error(transparent)]
    Store(StoreError),
}

/// Outcome of a successful conditional write.
#[derive(Debug)]
pub struct WriteOutcome {
    /// Fresh anchor at the store-reported post-insert position
    pub anchor: SyncAnchor,
    /// Set when the anchor had to be re-derived (surfaced to the user as an
    /// "insertion point was reset" notification)
    pub recovered: Option<RecoveryPath>,
}

/// Performs revision-guarded writes against the document store.
pub struct OptimisticWriter {
    store: Arc<dyn DocumentStore>,
    tokens: Arc<dyn TokenProvider>,
    /// Conditional-write attempts before ConflictExceeded
    max_attempts: u32,
    /// Deadline for each outbound store call
    call_deadline: Duration,
}

impl OptimisticWriter {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        tokens: Arc<dyn TokenProvider>,
        max_attempts: u32,
        call_deadline: Duration,
    ) -> Self {
        Self {
            store,
            tokens,
            max_attempts: max_attempts.max(1),
            call_deadline,
        }
    }

    /// Insert `text` at the document's anchor.
    ///
    /// `cached` is the last-known anchor; it is trusted only for the first
    /// attempt. Any conflict invalidates it and forces a fresh snapshot.
    #[tracing::instrument(skip(self, text, cached), fields(chars = text.chars().count()))]
    pub async fn write(
        &self,
        document_id: &str,
        text: &str,
        cached: Option<&SyncAnchor>,
    ) -> Result<WriteOutcome, WriteError> {
        let mut recovered: Option<RecoveryPath> = None;
        let mut guard: Option<(u32, String)> =
            cached.map(|a| (a.position, a.revision_token.clone()));

        for attempt in 1..=self.max_attempts {
            let token = self.tokens.access_token().await?;

            let (position, revision_token) = match guard.take() {
                Some(pair) => pair,
                None => {
                    let snapshot = self.deadline_snapshot(&token, document_id).await?;
                    match snapshot.anchor.as_ref() {
                        Some(anchor) => (anchor.position, snapshot.revision_token.clone()),
                        None => {
                            let (pos, path) = AnchorRecoveryStrategy::locate(document_id, &snapshot);
                            recovered = Some(path);
                            (pos, snapshot.revision_token.clone())
                        }
                    }
                }
            };

            let request = WriteRequest {
                revision_token: revision_token.clone(),
                operations: vec![
                    WriteOp::InsertText {
                        position,
                        text: text.to_string(),
                    },
                    WriteOp::UpsertAnchor {
                        position: position + text.chars().count() as u32,
                    },
                ],
            };

            match self.deadline_commit(&token, document_id, &request).await {
                Ok(receipt) => {
                    debug!(
                        document_id = %document_id,
                        attempt,
                        end_position = receipt.end_position,
                        "Conditional write accepted"
                    );
                    return Ok(WriteOutcome {
                        anchor: SyncAnchor::new(document_id, receipt.end_position, receipt.revision_token),
                        recovered,
                    });
                }
                Err(StoreError::Conflict { .. }) => {
                    warn!(
                        document_id = %document_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        "Revision conflict, re-deriving anchor"
                    );
                    crate::metrics::record_conflict(document_id);
                    // Next iteration re-snapshots; the stale guard is gone
                }
                Err(other) => return Err(WriteError::Store(other)),
            }
        }

        Err(WriteError::ConflictExceeded {
            attempts: self.max_attempts,
        })
    }

    async fn deadline_snapshot(
        &self,
        token: &AccessToken,
        document_id: &str,
    ) -> Result<crate::storage::traits::DocumentSnapshot, WriteError> {
        match tokio::time::timeout(self.call_deadline, self.store.snapshot(token, document_id)).await
        {
            Ok(result) => result.map_err(WriteError::Store),
            Err(_) => Err(WriteError::Store(StoreError::Timeout(self.call_deadline))),
        }
    }

    async fn deadline_commit(
        &self,
        token: &AccessToken,
        document_id: &str,
        request: &WriteRequest,
    ) -> Result<WriteReceipt, StoreError> {
        match tokio::time::timeout(
            self.call_deadline,
            self.store.commit(token, document_id, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.call_deadline)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryDocumentStore, StaticTokenProvider};

    fn writer(store: Arc<MemoryDocumentStore>) -> OptimisticWriter {
        OptimisticWriter::new(
            store,
            Arc::new(StaticTokenProvider::new("test-token")),
            3,
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_write_returns_store_reported_position() {
        let store = Arc::new(MemoryDocumentStore::new("doc"));
        let w = writer(store.clone());

        let outcome = w.write("doc", "hello ", None).await.unwrap();

        assert_eq!(outcome.anchor.position, store.snapshot_unchecked().end_position);
        assert_eq!(store.body(), "hello ");
    }

    #[tokio::test]
    async fn test_cached_anchor_skips_snapshot() {
        let store = Arc::new(MemoryDocumentStore::new("doc"));
        let w = writer(store.clone());

        // Seed the document and capture the resulting anchor
        let first = w.write("doc", "one ", None).await.unwrap();
        let snapshots_before = store.snapshot_calls();

        let second = w
            .write("doc", "two ", Some(&first.anchor))
            .await
            .unwrap();

        assert_eq!(store.snapshot_calls(), snapshots_before);
        assert!(second.recovered.is_none());
        assert_eq!(store.body(), "one two ");
    }

    #[tokio::test]
    async fn test_conflict_then_success_uses_authoritative_offset() {
        let store = Arc::new(MemoryDocumentStore::new("doc"));
        store.inject_conflicts(2);
        let w = writer(store.clone());

        let outcome = w.write("doc", "text ", None).await.unwrap();

        // Two failures, success on the 3rd attempt
        assert_eq!(store.commit_calls(), 3);
        assert_eq!(outcome.anchor.position, store.snapshot_unchecked().end_position);
    }

    #[tokio::test]
    async fn test_conflict_exceeded_after_three_attempts() {
        let store = Arc::new(MemoryDocumentStore::new("doc"));
        store.inject_conflicts(99);
        let w = writer(store.clone());

        let err = w.write("doc", "text ", None).await.unwrap_err();

        assert!(matches!(err, WriteError::ConflictExceeded { attempts: 3 }));
        assert_eq!(store.commit_calls(), 3);
    }

    #[tokio::test]
    async fn test_anchor_recovery_when_store_lost_anchor() {
        let store = Arc::new(MemoryDocumentStore::new("doc"));
        let w = writer(store.clone());
        w.write("doc", "seed text ", None).await.unwrap();

        // External actor deletes the anchor
        store.delete_anchor();

        let outcome = w.write("doc", "more ", None).await.unwrap();
        assert_eq!(outcome.recovered, Some(RecoveryPath::DocumentEnd));
        assert_eq!(store.body(), "seed text more ");
    }

    #[tokio::test]
    async fn test_non_conflict_error_passes_through() {
        let store = Arc::new(MemoryDocumentStore::new("doc"));
        store.set_offline(true);
        let w = writer(store.clone());

        let err = w.write("doc", "text ", None).await.unwrap_err();
        match err {
            WriteError::Store(e) => assert!(matches!(e, StoreError::Unreachable(_))),
            other => panic!("expected Store error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_unavailable_pauses_write() {
        let store = Arc::new(MemoryDocumentStore::new("doc"));
        let tokens = Arc::new(StaticTokenProvider::new("t"));
        tokens.set_available(false);
        let w = OptimisticWriter::new(store.clone(), tokens, 3, Duration::from_secs(10));

        let err = w.write("doc", "text ", None).await.unwrap_err();
        assert!(matches!(err, WriteError::Auth(_)));
        assert_eq!(store.commit_calls(), 0);
    }
}
