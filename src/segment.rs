//! Transcript segment data structures.
//!
//! The [`IncrementalSegment`] is the core data unit that flows through the
//! reconciliation pipeline. Segments arrive from the upstream transcription
//! producer with a per-session monotonic sequence id; only finalized
//! (`is_partial = false`) segments are eligible for synchronization.

use serde::{Deserialize, Serialize};

use crate::coalescer::SizedText;

/// A single transcript segment from the upstream speech pipeline.
///
/// Immutable once created. Wire names are camelCase to match the
/// producer protocol.
///
/// # Example
///
/// ```
/// use transcript_sync::IncrementalSegment;
///
/// let segment = IncrementalSegment::finalized("session-1", 1, "hello world");
/// assert!(!segment.is_partial);
/// assert_eq!(segment.sequence_id, 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalSegment {
    /// Monotonically increasing per session
    pub sequence_id: u64,
    /// Owning transcription session
    pub session_id: String,
    /// Capture timestamp (epoch millis)
    pub captured_at: i64,
    /// Partial segments are display-only and never synchronized
    pub is_partial: bool,
    /// Transcribed text
    pub text: String,
    /// Recognizer confidence (0.0 - 1.0)
    pub confidence: f32,
}

impl IncrementalSegment {
    /// Create a finalized segment (eligible for synchronization).
    pub fn finalized(session_id: impl Into<String>, sequence_id: u64, text: impl Into<String>) -> Self {
        Self {
            sequence_id,
            session_id: session_id.into(),
            captured_at: epoch_millis(),
            is_partial: false,
            text: text.into(),
            confidence: 1.0,
        }
    }

    /// Length of the text in characters (not bytes). Insert positions in the
    /// document store are character offsets, so sizing uses the same unit.
    #[must_use]
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

impl SizedText for IncrementalSegment {
    fn text_chars(&self) -> usize {
        self.char_len()
    }
}

/// A segment held in the offline queue while the document store is
/// unreachable. Owned exclusively by [`crate::queue::OfflineQueue`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub segment: IncrementalSegment,
    /// When the item entered the queue (epoch millis)
    pub enqueued_at: i64,
    /// Dispatch attempts that failed so far
    pub retry_count: u32,
    /// Most recent dispatch error, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(segment: IncrementalSegment) -> Self {
        Self {
            segment,
            enqueued_at: epoch_millis(),
            retry_count: 0,
            last_error: None,
        }
    }
}

/// An item that exhausted its retries or failed terminally, kept for the
/// operator instead of being silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub segment: IncrementalSegment,
    /// The error that killed the item
    pub error: String,
    /// Total dispatch attempts
    pub attempts: u32,
    /// When the item was dead-lettered (epoch millis)
    pub failed_at: i64,
}

/// Request toward the producer to replay a missing sequence range
/// after a detected gap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequest {
    pub session_id: String,
    pub from_sequence_id: u64,
    pub to_sequence_id: u64,
}

pub(crate) fn epoch_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
