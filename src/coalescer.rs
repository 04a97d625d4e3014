//! Segment coalescing for efficient writes.
//!
//! The [`BatchCoalescer`] collects finalized segments and releases them in
//! batches based on configurable thresholds: elapsed time, accumulated text
//! length, or segment count. Coalescing exists purely to reduce call volume
//! against the store's rate quota; it never reorders segments and never
//! merges across a detected sequence gap (the orchestrator force-flushes
//! with [`FlushReason::Gap`] before adding a non-contiguous segment).
//!
//! # Example
//!
//! ```
//! use transcript_sync::{BatchCoalescer, CoalesceConfig, IncrementalSegment};
//!
//! let mut coalescer = BatchCoalescer::new(CoalesceConfig::default());
//! assert!(coalescer.is_empty());
//!
//! coalescer.add(IncrementalSegment::finalized("s", 1, "hello"));
//! assert!(!coalescer.is_empty());
//! ```

use std::time::Duration;

use tokio::time::Instant;

use tracing::debug;

use crate::segment::IncrementalSegment;

/// Items that know their own text length in characters.
pub trait SizedText {
    #[must_use]
    fn text_chars(&self) -> usize;
}

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Accumulation-time window elapsed
    Time,
    /// Accumulated text length threshold reached
    Chars,
    /// Segment count threshold reached
    Count,
    /// Sequence gap detected; flushed to bound staleness
    Gap,
    /// Manual flush requested
    Manual,
    /// Shutdown flush
    Shutdown,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Chars => "chars",
            Self::Count => "count",
            Self::Gap => "gap",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Configuration for segment coalescing
#[derive(Debug, Clone)]
pub struct CoalesceConfig {
    /// Flush after this many milliseconds (even if the batch is small)
    pub window_ms: u64,
    /// Flush after this many accumulated text characters
    pub max_chars: usize,
    /// Flush after this many segments
    pub max_count: usize,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            window_ms: 3_000,
            max_chars: 500,
            max_count: 50,
        }
    }
}

/// A batch of segments released for dispatch
#[derive(Debug)]
pub struct FlushBatch {
    pub segments: Vec<IncrementalSegment>,
    pub total_chars: usize,
    pub reason: FlushReason,
}

impl FlushBatch {
    /// The combined document text: each segment's text followed by a single
    /// space, so consecutive batches concatenate cleanly.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::with_capacity(self.total_chars + self.segments.len());
        for segment in &self.segments {
            out.push_str(&segment.text);
            out.push(' ');
        }
        out
    }
}

/// Pending segments accumulated since the last flush
#[derive(Debug)]
struct Pending {
    segments: Vec<IncrementalSegment>,
    total_chars: usize,
    opened_at: Instant,
    last_sequence: Option<u64>,
    session_id: Option<String>,
}

impl Pending {
    fn new() -> Self {
        Self {
            segments: Vec::new(),
            total_chars: 0,
            opened_at: Instant::now(),
            last_sequence: None,
            session_id: None,
        }
    }

    fn push(&mut self, segment: IncrementalSegment) {
        self.total_chars += segment.text_chars();
        self.last_sequence = Some(segment.sequence_id);
        if self.session_id.is_none() {
            self.session_id = Some(segment.session_id.clone());
        }
        self.segments.push(segment);
    }

    fn take(&mut self) -> (Vec<IncrementalSegment>, usize) {
        let chars = self.total_chars;
        self.total_chars = 0;
        self.opened_at = Instant::now();
        self.last_sequence = None;
        self.session_id = None;
        (std::mem::take(&mut self.segments), chars)
    }
}

/// Coalescer that flushes on time, text length, or count thresholds.
/// Whichever threshold is hit first triggers the flush.
pub struct BatchCoalescer {
    config: CoalesceConfig,
    pending: Pending,
}

impl BatchCoalescer {
    #[must_use]
    pub fn new(config: CoalesceConfig) -> Self {
        Self {
            config,
            pending: Pending::new(),
        }
    }

    /// Whether `segment` directly continues the pending run (same session,
    /// next sequence id). A `false` here means the caller must flush with
    /// [`FlushReason::Gap`] before adding, so batches never span a gap.
    #[must_use]
    pub fn continues_run(&self, segment: &IncrementalSegment) -> bool {
        match (&self.pending.last_sequence, &self.pending.session_id) {
            (Some(last), Some(session)) => {
                segment.session_id == *session && segment.sequence_id == last + 1
            }
            _ => true, // empty batch accepts anything
        }
    }

    /// Add a segment, returning a flush reason if a threshold was hit.
    pub fn add(&mut self, segment: IncrementalSegment) -> Option<FlushReason> {
        self.pending.push(segment);

        if self.pending.segments.len() >= self.config.max_count {
            Some(FlushReason::Count)
        } else if self.pending.total_chars >= self.config.max_chars {
            Some(FlushReason::Chars)
        } else {
            None
        }
    }

    /// Check if the time window has elapsed with segments pending
    #[must_use]
    pub fn window_elapsed(&self) -> bool {
        !self.pending.segments.is_empty()
            && self.pending.opened_at.elapsed() >= Duration::from_millis(self.config.window_ms)
    }

    /// Take the pending batch if any threshold is ready
    pub fn take_if_ready(&mut self) -> Option<FlushBatch> {
        let reason = if self.pending.segments.len() >= self.config.max_count {
            Some(FlushReason::Count)
        } else if self.pending.total_chars >= self.config.max_chars {
            Some(FlushReason::Chars)
        } else if self.window_elapsed() {
            Some(FlushReason::Time)
        } else {
            None
        };

        reason.and_then(|r| self.force_flush_with_reason(r))
    }

    /// Force flush regardless of thresholds
    pub fn force_flush(&mut self) -> Option<FlushBatch> {
        self.force_flush_with_reason(FlushReason::Manual)
    }

    /// Force flush with a specific reason
    pub fn force_flush_with_reason(&mut self, reason: FlushReason) -> Option<FlushBatch> {
        if self.pending.segments.is_empty() {
            return None;
        }
        let (segments, total_chars) = self.pending.take();
        debug!(count = segments.len(), total_chars, reason = ?reason, "Coalesced batch released");
        Some(FlushBatch {
            segments,
            total_chars,
            reason,
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.segments.is_empty()
    }

    /// Current batch stats: (count, chars, age)
    #[must_use]
    pub fn stats(&self) -> (usize, usize, Duration) {
        (
            self.pending.segments.len(),
            self.pending.total_chars,
            self.pending.opened_at.elapsed(),
        )
    }
}
