//! Inbound segment ordering validation.
//!
//! The [`IngestSequencer`] tracks the last accepted sequence id per session
//! and classifies every inbound segment as accepted, duplicate, or gapped.
//! Gaps inside the replay window yield a [`ReplayRequest`] toward the
//! producer; older gaps are accepted as unrecoverable and only logged.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::segment::{IncrementalSegment, ReplayRequest};

/// Outcome of admitting one inbound segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Sequence continues; segment accepted
    Accepted,
    /// `sequence_id <= last_accepted`; segment dropped
    Duplicate,
    /// `sequence_id > last_accepted + 1`; segment still accepted, missing
    /// range requested from the producer when inside the replay window
    GapDetected {
        expected: u64,
        replay: Option<ReplayRequest>,
    },
}

/// Validates monotonic ordering of inbound segments per session.
pub struct IngestSequencer {
    last_accepted: HashMap<String, u64>,
    replay_window: u64,
    /// Set on any gap, cleared when attached to a status event
    discontinuity: bool,
}

impl IngestSequencer {
    #[must_use]
    pub fn new(replay_window: u64) -> Self {
        Self {
            last_accepted: HashMap::new(),
            replay_window,
            discontinuity: false,
        }
    }

    /// Seed per-session watermarks from persisted state so a restarted
    /// session rejects segments the previous run already accepted.
    #[must_use]
    pub fn with_acknowledged(replay_window: u64, acknowledged: HashMap<String, u64>) -> Self {
        Self {
            last_accepted: acknowledged,
            replay_window,
            discontinuity: false,
        }
    }

    /// Validate one inbound segment and advance the session watermark.
    pub fn accept(&mut self, segment: &IncrementalSegment) -> Admission {
        let last = self.last_accepted.get(&segment.session_id).copied();

        let admission = match last {
            Some(last) if segment.sequence_id <= last => {
                debug!(
                    session_id = %segment.session_id,
                    sequence_id = segment.sequence_id,
                    last_accepted = last,
                    "Duplicate segment dropped"
                );
                return Admission::Duplicate;
            }
            Some(last) if segment.sequence_id > last + 1 => {
                let expected = last + 1;
                let gap_len = segment.sequence_id - expected;
                self.discontinuity = true;

                let replay = if gap_len <= self.replay_window {
                    Some(ReplayRequest {
                        session_id: segment.session_id.clone(),
                        from_sequence_id: expected,
                        to_sequence_id: segment.sequence_id - 1,
                    })
                } else {
                    warn!(
                        session_id = %segment.session_id,
                        expected,
                        received = segment.sequence_id,
                        gap_len,
                        replay_window = self.replay_window,
                        "Sequence gap exceeds replay window, accepting as unrecoverable"
                    );
                    None
                };

                Admission::GapDetected { expected, replay }
            }
            _ => Admission::Accepted,
        };

        self.last_accepted
            .insert(segment.session_id.clone(), segment.sequence_id);
        admission
    }

    /// Last accepted sequence id for a session, if any.
    #[must_use]
    pub fn last_accepted(&self, session_id: &str) -> Option<u64> {
        self.last_accepted.get(session_id).copied()
    }

    /// Roll a session's watermark back to a previously observed value.
    ///
    /// Used when a segment admitted by [`accept`](Self::accept) is then
    /// rejected downstream (queue at capacity): the id stays admissible so
    /// a later redelivery is not dropped as a duplicate.
    pub fn restore(&mut self, session_id: &str, watermark: Option<u64>) {
        match watermark {
            Some(value) => {
                self.last_accepted.insert(session_id.to_string(), value);
            }
            None => {
                self.last_accepted.remove(session_id);
            }
        }
    }

    /// All session watermarks (for persistence).
    #[must_use]
    pub fn watermarks(&self) -> &HashMap<String, u64> {
        &self.last_accepted
    }

    /// Take the discontinuity flag, clearing it. The orchestrator attaches
    /// this to the next emitted status event.
    pub fn take_discontinuity(&mut self) -> bool {
        std::mem::take(&mut self.discontinuity)
    }
}
