//! Insertion anchor tracking and recovery.
//!
//! The anchor is the tracked insertion position within the external
//! document, analogous to a named cursor. It is re-derived from a fresh
//! snapshot whenever a conflict invalidates it; an anchor is never
//! incrementally trusted across a conflict.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::segment::epoch_millis;
use crate::storage::traits::DocumentSnapshot;

/// Where the next segment must be inserted. At most one anchor per
/// document is live at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncAnchor {
    pub document_id: String,
    /// Character offset of the insertion point
    pub position: u32,
    /// Opaque store revision the anchor was derived under
    pub revision_token: String,
    /// When the anchor was last confirmed against the store (epoch millis)
    pub last_verified_at: i64,
}

impl SyncAnchor {
    pub fn new(document_id: impl Into<String>, position: u32, revision_token: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            position,
            revision_token: revision_token.into(),
            last_verified_at: epoch_millis(),
        }
    }
}

/// Which heuristic produced the recovered position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPath {
    /// Designated marker heading found; position is immediately after it
    Marker,
    /// No marker; fell back to the document's end position
    DocumentEnd,
    /// Empty document; fell back to the document start
    DocumentStart,
}

impl std::fmt::Display for RecoveryPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Marker => write!(f, "marker"),
            Self::DocumentEnd => write!(f, "document-end"),
            Self::DocumentStart => write!(f, "document-start"),
        }
    }
}

/// Prioritized heuristic search for a lost insertion point.
///
/// Side-effect-free: it only reads the snapshot. The anchor itself is
/// (re)created by the next conditional write's `UpsertAnchor` operation.
/// Deterministic: two calls against the same snapshot return the same
/// position.
pub struct AnchorRecoveryStrategy;

impl AnchorRecoveryStrategy {
    /// Locate the insertion position in a document whose anchor is missing.
    ///
    /// Tried in order: marker heading, document end, document start.
    /// Logged at warn severity; this path is expected to run rarely, only
    /// after an external edit deleted the anchor.
    #[must_use]
    pub fn locate(document_id: &str, snapshot: &DocumentSnapshot) -> (u32, RecoveryPath) {
        let (position, path) = if let Some(after_marker) = snapshot.marker_position {
            (after_marker, RecoveryPath::Marker)
        } else if snapshot.char_count > 0 {
            (snapshot.end_position, RecoveryPath::DocumentEnd)
        } else {
            (1, RecoveryPath::DocumentStart)
        };

        warn!(
            document_id = %document_id,
            position,
            path = %path,
            "Insertion anchor missing, recovered via heuristic search"
        );
        crate::metrics::record_anchor_recovery(&path.to_string());

        (position, path)
    }
}
