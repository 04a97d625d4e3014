//! Property-based tests for ingest and coalescing invariants.
//!
//! Generates random segment streams and malformed wire input and verifies
//! the core never panics, never reorders, and never accepts out-of-order
//! sequence ids.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;

use transcript_sync::{
    Admission, BatchCoalescer, CoalesceConfig, FlushReason, IncrementalSegment, IngestSequencer,
};

/// A plausible-looking finalized segment with random text.
fn segment_strategy() -> impl Strategy<Value = IncrementalSegment> {
    ("[a-z]{1,8}", 0u64..10_000, ".{0,200}").prop_map(|(session, seq, text)| {
        IncrementalSegment::finalized(session, seq, text)
    })
}

proptest! {
    /// Arbitrary bytes on the wire never panic the deserializer; they
    /// either parse or return a clean error.
    #[test]
    fn segment_deserialization_never_panics(input in ".{0,500}") {
        let _ = serde_json::from_str::<IncrementalSegment>(&input);
    }

    /// Valid segments survive a serialize/deserialize cycle intact.
    #[test]
    fn segment_wire_roundtrip(segment in segment_strategy()) {
        let json = serde_json::to_string(&segment).unwrap();
        let back: IncrementalSegment = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back.sequence_id, segment.sequence_id);
        prop_assert_eq!(back.session_id, segment.session_id);
        prop_assert_eq!(back.text, segment.text);
    }

    /// Whatever order sequence ids arrive in, the accepted watermark per
    /// session only ever moves forward, and nothing at or below it is
    /// admitted again.
    #[test]
    fn sequencer_watermark_is_monotonic(
        ids in prop::collection::vec((0u8..3, 1u64..500), 1..200)
    ) {
        let sessions = ["a", "b", "c"];
        let mut sequencer = IngestSequencer::new(600);
        let mut highest: std::collections::HashMap<&str, u64> = Default::default();

        for (session_idx, seq) in ids {
            let session = sessions[session_idx as usize];
            let segment = IncrementalSegment::finalized(session, seq, "x");
            let before = highest.get(session).copied();

            match sequencer.accept(&segment) {
                Admission::Duplicate => {
                    let last = before.expect("duplicate without prior acceptance");
                    prop_assert!(seq <= last);
                }
                Admission::Accepted | Admission::GapDetected { .. } => {
                    if let Some(last) = before {
                        prop_assert!(seq > last, "admitted non-advancing id");
                    }
                    highest.insert(session, seq);
                }
            }
            prop_assert_eq!(sequencer.last_accepted(session), highest.get(session).copied());
        }
    }

    /// A gap's replay request covers exactly the missing range and never
    /// exceeds the configured window.
    #[test]
    fn replay_requests_cover_the_gap(
        start in 1u64..1000,
        gap in 1u64..1000,
        window in 1u64..800,
    ) {
        let mut sequencer = IngestSequencer::new(window);
        sequencer.accept(&IncrementalSegment::finalized("s", start, "x"));

        let next = start + gap + 1;
        match sequencer.accept(&IncrementalSegment::finalized("s", next, "x")) {
            Admission::GapDetected { expected, replay } => {
                prop_assert_eq!(expected, start + 1);
                match replay {
                    Some(request) => {
                        prop_assert!(gap <= window);
                        prop_assert_eq!(request.from_sequence_id, start + 1);
                        prop_assert_eq!(request.to_sequence_id, next - 1);
                    }
                    None => prop_assert!(gap > window),
                }
            }
            other => prop_assert!(false, "expected gap, got {:?}", other),
        }
    }

    /// Coalescing never reorders: concatenating every flushed batch
    /// reproduces the input segment order exactly, and no batch spans a
    /// sequence discontinuity.
    #[test]
    fn coalescer_preserves_order_and_contiguity(
        start in 1u64..100,
        lens in prop::collection::vec(1usize..30, 1..50),
        max_count in 1usize..20,
    ) {
        let mut coalescer = BatchCoalescer::new(CoalesceConfig {
            window_ms: 60_000,
            max_chars: 200,
            max_count,
        });

        // Contiguous run with an artificial gap in the middle
        let mut input = Vec::new();
        let mut seq = start;
        for (i, len) in lens.iter().enumerate() {
            if i == lens.len() / 2 {
                seq += 10; // gap
            }
            input.push(IncrementalSegment::finalized("s", seq, "x".repeat(*len)));
            seq += 1;
        }

        let mut flushed = Vec::new();
        for segment in input.clone() {
            if !coalescer.continues_run(&segment) {
                if let Some(batch) = coalescer.force_flush_with_reason(FlushReason::Gap) {
                    flushed.push(batch);
                }
            }
            if coalescer.add(segment).is_some() {
                if let Some(batch) = coalescer.force_flush() {
                    flushed.push(batch);
                }
            }
        }
        if let Some(batch) = coalescer.force_flush() {
            flushed.push(batch);
        }

        let replayed: Vec<u64> = flushed
            .iter()
            .flat_map(|b| b.segments.iter().map(|s| s.sequence_id))
            .collect();
        let original: Vec<u64> = input.iter().map(|s| s.sequence_id).collect();
        prop_assert_eq!(replayed, original);

        for batch in &flushed {
            prop_assert!(batch.segments.len() <= max_count);
            for pair in batch.segments.windows(2) {
                prop_assert_eq!(pair[1].sequence_id, pair[0].sequence_id + 1,
                    "batch spans a discontinuity");
            }
        }
    }
}
