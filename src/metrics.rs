//! Metric helper functions.
//!
//! Thin wrappers over the `metrics` facade so call sites stay one-liners
//! and every series carries the `transcript_sync_` prefix. Whether the
//! numbers go anywhere is up to the embedding application's recorder.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Segments admitted by the sequencer.
pub fn record_segment_accepted(session_id: &str) {
    counter!("transcript_sync_segments_accepted_total", "session" => session_id.to_string())
        .increment(1);
}

/// Duplicate segments dropped on ingest.
pub fn record_segment_duplicate(session_id: &str) {
    counter!("transcript_sync_segments_duplicate_total", "session" => session_id.to_string())
        .increment(1);
}

/// Sequence gaps observed, whether or not a replay was requested.
pub fn record_sequence_gap(session_id: &str, replay_requested: bool) {
    let replay = if replay_requested { "requested" } else { "skipped" };
    counter!(
        "transcript_sync_sequence_gaps_total",
        "session" => session_id.to_string(),
        "replay" => replay,
    )
    .increment(1);
}

/// Batches flushed out of the coalescer, labelled by trigger.
pub fn record_batch_flush(reason: &str, segments: usize, chars: usize) {
    counter!("transcript_sync_batches_flushed_total", "reason" => reason.to_string())
        .increment(1);
    histogram!("transcript_sync_batch_segments").record(segments as f64);
    histogram!("transcript_sync_batch_chars").record(chars as f64);
}

/// Time spent blocked on the token bucket before a write slot opened.
pub fn record_rate_wait(waited: Duration) {
    histogram!("transcript_sync_rate_wait_seconds").record(waited.as_secs_f64());
}

/// One end-to-end dispatch attempt against the document store.
pub fn record_dispatch(outcome: &str, elapsed: Duration) {
    counter!("transcript_sync_dispatches_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("transcript_sync_dispatch_seconds", "outcome" => outcome.to_string())
        .record(elapsed.as_secs_f64());
}

/// Retries performed by the classified retry wrapper.
pub fn record_dispatch_retry(operation: &str) {
    counter!("transcript_sync_dispatch_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Revision conflicts reported by the store.
pub fn record_conflict(document_id: &str) {
    counter!("transcript_sync_write_conflicts_total", "document" => document_id.to_string())
        .increment(1);
}

/// Anchor recoveries, labelled by the path that won.
pub fn record_anchor_recovery(path: &str) {
    counter!("transcript_sync_anchor_recoveries_total", "path" => path.to_string()).increment(1);
}

/// Current depth of the durable offline queue.
pub fn set_queue_depth(depth: usize) {
    gauge!("transcript_sync_queue_depth").set(depth as f64);
}

/// Segments moved to the dead-letter buffer.
pub fn record_dead_letter() {
    counter!("transcript_sync_dead_letters_total").increment(1);
}

/// Orchestrator mode transitions.
pub fn record_mode_transition(from: &str, to: &str) {
    counter!(
        "transcript_sync_mode_transitions_total",
        "from" => from.to_string(),
        "to" => to.to_string(),
    )
    .increment(1);
}

/// Connectivity probes while offline.
pub fn record_probe(success: bool) {
    let outcome = if success { "online" } else { "offline" };
    counter!("transcript_sync_probes_total", "outcome" => outcome).increment(1);
}
