//! Configuration for the sync orchestrator.
//!
//! # Example
//!
//! ```
//! use transcript_sync::SyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.queue_capacity, 500);
//!
//! // Full config
//! let config = SyncConfig {
//!     document_id: "doc-123".into(),
//!     queue_capacity: 100,
//!     rate_capacity: 30,
//!     coalesce_window_ms: 1_000,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Configuration for one document sync pipeline.
///
/// All thresholds are product-tuned defaults, not invariants; override them
/// to match the target store's quota and the producer's cadence. One config
/// drives one [`crate::orchestrator::SyncOrchestrator`] instance; parallel
/// documents get parallel instances with independent quotas.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Target document in the external store
    #[serde(default)]
    pub document_id: String,

    /// Offline queue capacity in items (enqueue past this fails fast)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Queue depth ratio that triggers a non-fatal watermark warning
    #[serde(default = "default_queue_warn_ratio")]
    pub queue_warn_ratio: f64,

    /// Dispatch attempts per queued item before dead-lettering
    #[serde(default = "default_queue_retry_limit")]
    pub queue_retry_limit: u32,

    /// Token bucket capacity (store's per-window quota)
    #[serde(default = "default_rate_capacity")]
    pub rate_capacity: u32,

    /// Token refill rate per second (1.0 for a 60-per-minute budget)
    #[serde(default = "default_rate_refill_per_sec")]
    pub rate_refill_per_sec: f64,

    /// Coalescing settings: flush after this many milliseconds
    #[serde(default = "default_coalesce_window_ms")]
    pub coalesce_window_ms: u64,
    /// ... or after this many accumulated text characters
    #[serde(default = "default_coalesce_chars")]
    pub coalesce_chars: usize,
    /// ... or after this many segments
    #[serde(default = "default_coalesce_count")]
    pub coalesce_count: usize,

    /// Conditional-write attempts before giving up on a conflicted batch
    #[serde(default = "default_conflict_retry_limit")]
    pub conflict_retry_limit: u32,

    /// How far back a sequence gap is worth replaying (segments)
    #[serde(default = "default_replay_window")]
    pub replay_window: u64,

    /// Deadline for each outbound store call (milliseconds)
    #[serde(default = "default_store_deadline_ms")]
    pub store_deadline_ms: u64,

    /// Connectivity probe cadence while offline (milliseconds)
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Resync drain budget: stop after this many items per cycle
    #[serde(default = "default_resync_max_items")]
    pub resync_max_items: usize,
    /// ... or after this much wall-clock time (milliseconds)
    #[serde(default = "default_resync_max_ms")]
    pub resync_max_ms: u64,

    /// Bounded channel capacities
    #[serde(default = "default_ingest_channel_capacity")]
    pub ingest_channel_capacity: usize,
    #[serde(default = "default_status_channel_capacity")]
    pub status_channel_capacity: usize,
}

fn default_queue_capacity() -> usize { 500 }
fn default_queue_warn_ratio() -> f64 { 0.8 }
fn default_queue_retry_limit() -> u32 { 3 }
fn default_rate_capacity() -> u32 { 60 }
fn default_rate_refill_per_sec() -> f64 { 1.0 }
fn default_coalesce_window_ms() -> u64 { 3_000 }
fn default_coalesce_chars() -> usize { 500 }
fn default_coalesce_count() -> usize { 50 }
fn default_conflict_retry_limit() -> u32 { 3 }
fn default_replay_window() -> u64 { 600 }
fn default_store_deadline_ms() -> u64 { 10_000 }
fn default_probe_interval_ms() -> u64 { 5_000 }
fn default_resync_max_items() -> usize { 200 }
fn default_resync_max_ms() -> u64 { 30_000 }
fn default_ingest_channel_capacity() -> usize { 256 }
fn default_status_channel_capacity() -> usize { 64 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            document_id: String::new(),
            queue_capacity: default_queue_capacity(),
            queue_warn_ratio: default_queue_warn_ratio(),
            queue_retry_limit: default_queue_retry_limit(),
            rate_capacity: default_rate_capacity(),
            rate_refill_per_sec: default_rate_refill_per_sec(),
            coalesce_window_ms: default_coalesce_window_ms(),
            coalesce_chars: default_coalesce_chars(),
            coalesce_count: default_coalesce_count(),
            conflict_retry_limit: default_conflict_retry_limit(),
            replay_window: default_replay_window(),
            store_deadline_ms: default_store_deadline_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            resync_max_items: default_resync_max_items(),
            resync_max_ms: default_resync_max_ms(),
            ingest_channel_capacity: default_ingest_channel_capacity(),
            status_channel_capacity: default_status_channel_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_tuned_constants() {
        let config = SyncConfig::default();

        assert_eq!(config.queue_capacity, 500);
        assert_eq!(config.queue_warn_ratio, 0.8);
        assert_eq!(config.rate_capacity, 60);
        assert_eq!(config.rate_refill_per_sec, 1.0);
        assert_eq!(config.coalesce_window_ms, 3_000);
        assert_eq!(config.coalesce_chars, 500);
        assert_eq!(config.conflict_retry_limit, 3);
        assert_eq!(config.replay_window, 600);
        assert_eq!(config.store_deadline_ms, 10_000);
    }

    #[test]
    fn test_deserialize_partial_config_fills_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"document_id": "doc-1", "queue_capacity": 100}"#,
        )
        .unwrap();

        assert_eq!(config.document_id, "doc-1");
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.rate_capacity, 60); // default
        assert_eq!(config.coalesce_window_ms, 3_000); // default
    }
}
