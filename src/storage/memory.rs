//! In-memory storage backends.
//!
//! `MemoryStateStore` backs tests and ephemeral deployments where crash
//! durability is not needed. `MemoryDocumentStore` is a scriptable stand-in
//! for the remote collaborative store: it enforces revision guards, tracks
//! call counts, and can be told to go offline, lose quota, or conflict a
//! fixed number of times. `StaticTokenProvider` hands out a fixed credential
//! that can be toggled unavailable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::anchor::SyncAnchor;
use crate::storage::traits::{
    AccessToken, AuthUnavailable, DocumentSnapshot, DocumentStore, StateError, StateStore,
    StoreError, TokenProvider, WriteOp, WriteReceipt, WriteRequest,
};

/// Key/value state store held entirely in memory.
#[derive(Default)]
pub struct MemoryStateStore {
    records: DashMap<String, String>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StateError> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn replace(&self, key: &str, value: &str) -> Result<(), StateError> {
        self.records.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StateError> {
        self.records.remove(key);
        Ok(())
    }
}

struct DocState {
    body: String,
    revision: u64,
    anchor: Option<SyncAnchor>,
    marker_position: Option<u32>,
}

/// Scriptable in-memory document store.
pub struct MemoryDocumentStore {
    document_id: String,
    state: Mutex<DocState>,
    offline: AtomicBool,
    quota_exhausted: AtomicBool,
    conflicts_remaining: AtomicU64,
    snapshot_count: AtomicU64,
    commit_count: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            state: Mutex::new(DocState {
                body: String::new(),
                revision: 1,
                anchor: None,
                marker_position: None,
            }),
            offline: AtomicBool::new(false),
            quota_exhausted: AtomicBool::new(false),
            conflicts_remaining: AtomicU64::new(0),
            snapshot_count: AtomicU64::new(0),
            commit_count: AtomicU64::new(0),
        }
    }

    /// Simulate loss of connectivity; every call fails Unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Simulate write-quota exhaustion on commits.
    pub fn set_quota_exhausted(&self, exhausted: bool) {
        self.quota_exhausted.store(exhausted, Ordering::SeqCst);
    }

    /// Fail the next `n` commits with a revision conflict.
    pub fn inject_conflicts(&self, n: u64) {
        self.conflicts_remaining.store(n, Ordering::SeqCst);
    }

    /// Simulate a collaborator editing the document: the body changes and
    /// the revision advances, invalidating any outstanding guard.
    pub fn external_edit(&self, text: &str) {
        let mut state = self.state.lock();
        state.body.push_str(text);
        state.revision += 1;
    }

    /// Simulate a collaborator deleting the sync anchor.
    pub fn delete_anchor(&self) {
        let mut state = self.state.lock();
        state.anchor = None;
        state.revision += 1;
    }

    /// Place a section marker that anchor recovery can target.
    pub fn set_marker(&self, position: u32) {
        self.state.lock().marker_position = Some(position);
    }

    /// Seed the document with content, as if it pre-existed.
    pub fn seed_body(&self, text: &str) {
        let mut state = self.state.lock();
        state.body = text.to_string();
        state.revision += 1;
    }

    pub fn body(&self) -> String {
        self.state.lock().body.clone()
    }

    pub fn snapshot_calls(&self) -> u64 {
        self.snapshot_count.load(Ordering::SeqCst)
    }

    pub fn commit_calls(&self) -> u64 {
        self.commit_count.load(Ordering::SeqCst)
    }

    /// Current snapshot without the connectivity/credential checks.
    pub fn snapshot_unchecked(&self) -> DocumentSnapshot {
        let state = self.state.lock();
        DocumentSnapshot {
            revision_token: state.revision.to_string(),
            end_position: state.body.chars().count() as u32,
            char_count: state.body.chars().count() as u32,
            marker_position: state.marker_position,
            anchor: state.anchor.clone(),
        }
    }

    fn connectivity_check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("simulated outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn snapshot(
        &self,
        _token: &AccessToken,
        document_id: &str,
    ) -> Result<DocumentSnapshot, StoreError> {
        self.snapshot_count.fetch_add(1, Ordering::SeqCst);
        self.connectivity_check()?;
        if document_id != self.document_id {
            return Err(StoreError::NotFound(document_id.to_string()));
        }
        Ok(self.snapshot_unchecked())
    }

    async fn commit(
        &self,
        _token: &AccessToken,
        document_id: &str,
        request: &WriteRequest,
    ) -> Result<WriteReceipt, StoreError> {
        self.commit_count.fetch_add(1, Ordering::SeqCst);
        self.connectivity_check()?;
        if document_id != self.document_id {
            return Err(StoreError::NotFound(document_id.to_string()));
        }
        if self.quota_exhausted.load(Ordering::SeqCst) {
            return Err(StoreError::QuotaExceeded);
        }
        if self
            .conflicts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Conflict {
                guard: request.revision_token.clone(),
            });
        }

        let mut state = self.state.lock();
        if request.revision_token != state.revision.to_string() {
            return Err(StoreError::Conflict {
                guard: request.revision_token.clone(),
            });
        }

        for op in &request.operations {
            match op {
                WriteOp::InsertText { position, text } => {
                    // Clamp to the body like the real store does for
                    // stale-but-valid guards
                    let idx = (*position as usize).min(state.body.chars().count());
                    let byte_idx = state
                        .body
                        .char_indices()
                        .nth(idx)
                        .map(|(b, _)| b)
                        .unwrap_or(state.body.len());
                    state.body.insert_str(byte_idx, text);
                }
                WriteOp::UpsertAnchor { position } => {
                    // Clamped the same way as inserts
                    let clamped = (*position).min(state.body.chars().count() as u32);
                    state.anchor = Some(SyncAnchor::new(
                        &self.document_id,
                        clamped,
                        (state.revision + 1).to_string(),
                    ));
                }
            }
        }

        state.revision += 1;
        let committed = state.revision.to_string();
        let end_position = state.body.chars().count() as u32;
        // Keep the stored anchor's token in step with the committed revision
        if let Some(anchor) = state.anchor.as_mut() {
            anchor.revision_token = committed.clone();
        }
        Ok(WriteReceipt {
            revision_token: committed,
            end_position,
        })
    }
}

/// Token provider returning a fixed credential.
pub struct StaticTokenProvider {
    token: String,
    available: AtomicBool,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle credential availability to exercise the pause path.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<AccessToken, AuthUnavailable> {
        if self.available.load(Ordering::SeqCst) {
            Ok(AccessToken(self.token.clone()))
        } else {
            Err(AuthUnavailable("credential provider paused".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> AccessToken {
        AccessToken("t".to_string())
    }

    #[tokio::test]
    async fn test_state_store_round_trip() {
        let store = MemoryStateStore::new();
        store.replace("queue/doc", "[]").await.unwrap();
        assert_eq!(store.load("queue/doc").await.unwrap().as_deref(), Some("[]"));
        store.remove("queue/doc").await.unwrap();
        assert!(store.load("queue/doc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_rejects_stale_revision() {
        let store = MemoryDocumentStore::new("doc");
        let snap = store.snapshot(&token(), "doc").await.unwrap();
        store.external_edit("collaborator text");

        let request = WriteRequest {
            revision_token: snap.revision_token,
            operations: vec![WriteOp::InsertText {
                position: 1,
                text: "mine".to_string(),
            }],
        };
        let err = store.commit(&token(), "doc", &request).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_receipt_reports_post_insert_position() {
        let store = MemoryDocumentStore::new("doc");
        let snap = store.snapshot(&token(), "doc").await.unwrap();

        let request = WriteRequest {
            revision_token: snap.revision_token,
            operations: vec![WriteOp::InsertText {
                position: 1,
                text: "hello".to_string(),
            }],
        };
        let receipt = store.commit(&token(), "doc", &request).await.unwrap();
        assert_eq!(receipt.end_position, 5);
    }

    #[tokio::test]
    async fn test_stored_anchor_token_matches_committed_revision() {
        let store = MemoryDocumentStore::new("doc");
        let snap = store.snapshot(&token(), "doc").await.unwrap();

        let request = WriteRequest {
            revision_token: snap.revision_token,
            operations: vec![
                WriteOp::InsertText {
                    position: 1,
                    text: "hello".to_string(),
                },
                WriteOp::UpsertAnchor { position: 5 },
            ],
        };
        let receipt = store.commit(&token(), "doc", &request).await.unwrap();

        let after = store.snapshot(&token(), "doc").await.unwrap();
        let anchor = after.anchor.expect("anchor was upserted");
        assert_eq!(anchor.revision_token, receipt.revision_token);
        assert_eq!(anchor.revision_token, after.revision_token);
    }

    #[tokio::test]
    async fn test_offline_flag_fails_all_calls() {
        let store = MemoryDocumentStore::new("doc");
        store.set_offline(true);
        let err = store.snapshot(&token(), "doc").await.unwrap_err();
        assert!(matches!(err, StoreError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_unknown_document_is_not_found() {
        let store = MemoryDocumentStore::new("doc");
        let err = store.snapshot(&token(), "other").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
