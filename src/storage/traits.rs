//! External interface traits: document store, credential provider,
//! persisted state.
//!
//! The reconciliation core never talks to a concrete backend directly;
//! everything flows through these traits so the orchestrator can be driven
//! against the in-memory fakes in tests and against the REST client in
//! production.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::anchor::SyncAnchor;

/// Failure taxonomy for outbound store calls.
///
/// The category, not the concrete error, decides the orchestrator's
/// reaction: connectivity flips the session offline, quota gets backoff,
/// conflict stays inside the optimistic writer, terminal dead-letters the
/// item, credential pauses dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network unreachable or deadline exceeded; retried on reconnect
    Connectivity,
    /// Store reported rate-limit exceeded; retried with backoff
    Quota,
    /// Revision token mismatch; handled inside the optimistic writer
    Conflict,
    /// Access denied or document missing; retrying cannot help
    Terminal,
    /// No valid bearer credential; dispatch pauses, queue preserved
    Credential,
}

/// Error from the external document store (or the transport to it).
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("network unreachable: {0}")]
    Unreachable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store rate limit exceeded")]
    QuotaExceeded,
    #[error("revision conflict: write guarded by stale token '{guard}'")]
    Conflict { guard: String },
    #[error("credential rejected by store")]
    CredentialRejected,
    #[error("access denied: {0}")]
    PermissionDenied(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("store server error: {0}")]
    Server(String),
}

impl StoreError {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Unreachable(_) | Self::Timeout(_) => FailureKind::Connectivity,
            Self::QuotaExceeded | Self::Server(_) => FailureKind::Quota,
            Self::Conflict { .. } => FailureKind::Conflict,
            Self::CredentialRejected => FailureKind::Credential,
            Self::PermissionDenied(_) | Self::NotFound(_) => FailureKind::Terminal,
        }
    }
}

/// Error from the local durable state store.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("state backend error: {0}")]
    Backend(String),
    #[error("corrupt state record '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

/// The credential provider could not produce a token right now.
///
/// Terminal-for-now: dispatch pauses without discarding the queue and
/// resumes automatically once a token becomes available again.
#[derive(Error, Debug, Clone)]
#[error("no valid access token available: {0}")]
pub struct AuthUnavailable(pub String);

/// Bearer credential for the document store.
#[derive(Debug, Clone)]
pub struct AccessToken(pub String);

/// A point-in-time view of the target document, read immediately before a
/// conditional write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    /// Opaque version guard for the subsequent conditional write
    pub revision_token: String,
    /// Authoritative end-of-body offset
    pub end_position: u32,
    /// Total characters in the document body
    pub char_count: u32,
    /// Offset immediately after the designated marker heading, if present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_position: Option<u32>,
    /// The live insertion anchor, if the store still has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<SyncAnchor>,
}

/// One operation inside a batched conditional write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum WriteOp {
    InsertText { position: u32, text: String },
    UpsertAnchor { position: u32 },
}

/// A batched conditional write, guarded by the revision token read
/// immediately prior. The store rejects the whole request with
/// [`StoreError::Conflict`] if the token is stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub revision_token: String,
    pub operations: Vec<WriteOp>,
}

/// Store-reported outcome of a successful conditional write.
///
/// `end_position` is the authoritative post-insert offset; the writer never
/// computes it locally by adding text length.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReceipt {
    pub revision_token: String,
    pub end_position: u32,
}

/// The external collaborative document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read the document's current revision, end position, and anchor.
    async fn snapshot(
        &self,
        token: &AccessToken,
        document_id: &str,
    ) -> Result<DocumentSnapshot, StoreError>;

    /// Perform a batched conditional write guarded by `request.revision_token`.
    async fn commit(
        &self,
        token: &AccessToken,
        document_id: &str,
        request: &WriteRequest,
    ) -> Result<WriteReceipt, StoreError>;
}

/// Produces a bearer credential on demand.
///
/// The core never runs the auth UI flow itself; it calls this on every
/// outbound attempt.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<AccessToken, AuthUnavailable>;
}

/// Local durable key-value store with whole-record semantics.
///
/// Each logical record (queue contents, anchor, acknowledged sequence ids)
/// is serialized as one value and replaced atomically as a whole; there are
/// no partial-field updates. Records are read fully into memory at startup.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, StateError>;
    async fn replace(&self, key: &str, value: &str) -> Result<(), StateError>;
    async fn remove(&self, key: &str) -> Result<(), StateError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_classification() {
        assert_eq!(
            StoreError::Unreachable("dns".into()).kind(),
            FailureKind::Connectivity
        );
        assert_eq!(
            StoreError::Timeout(Duration::from_secs(10)).kind(),
            FailureKind::Connectivity
        );
        assert_eq!(StoreError::QuotaExceeded.kind(), FailureKind::Quota);
        assert_eq!(
            StoreError::Server("500".into()).kind(),
            FailureKind::Quota
        );
        assert_eq!(
            StoreError::Conflict { guard: "r1".into() }.kind(),
            FailureKind::Conflict
        );
        assert_eq!(
            StoreError::PermissionDenied("doc".into()).kind(),
            FailureKind::Terminal
        );
        assert_eq!(
            StoreError::NotFound("doc".into()).kind(),
            FailureKind::Terminal
        );
        assert_eq!(
            StoreError::CredentialRejected.kind(),
            FailureKind::Credential
        );
    }

    #[test]
    fn test_write_op_wire_format() {
        let op = WriteOp::InsertText {
            position: 42,
            text: "hello".into(),
        };
        let json = serde_json::to_string(&op).unwrap();

        assert!(json.contains(r#""op":"insertText""#));
        assert!(json.contains(r#""position":42"#));

        let back: WriteOp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_write_request_roundtrip() {
        let req = WriteRequest {
            revision_token: "rev-7".into(),
            operations: vec![
                WriteOp::InsertText { position: 10, text: "x".into() },
                WriteOp::UpsertAnchor { position: 11 },
            ],
        };

        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("revisionToken"));

        let back: WriteRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.operations, req.operations);
    }
}
