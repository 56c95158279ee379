use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use crate::ids::ParticipantId;
use crate::sink::TraceSink;

/// Which ack-counted round a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    EndRecording,
    Snapshot,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndRecording => write!(f, "end-recording"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

pub(crate) enum AckSource {
    Participant(ParticipantId),
    Bridge,
    Local,
}

pub(crate) enum AckOutcome {
    /// Duplicate, late, or never-awaited ack; nothing changed.
    Ignored,
    Progressed {
        /// `remaining` just dropped to 1 with the local collection still
        /// unflushed: time to flush it to completion.
        local_flush_due: bool,
        /// `remaining` reached 0: finalize exactly once.
        complete: bool,
    },
}

/// Fan-in bookkeeping for one operation.
///
/// Invariant: `remaining == |awaiting| + bridge_pending + local_pending`.
/// The awaiting set snapshots the live participants at start; later
/// joiners are not tracked.
pub(crate) struct AckCounter {
    remaining: usize,
    awaiting: BTreeSet<ParticipantId>,
    bridge_pending: bool,
    local_pending: bool,
    local_flush_started: bool,
}

impl AckCounter {
    pub fn new(awaiting: BTreeSet<ParticipantId>, bridge_engaged: bool) -> Self {
        let remaining = awaiting.len() + 1 + usize::from(bridge_engaged);
        Self {
            remaining,
            awaiting,
            bridge_pending: bridge_engaged,
            local_pending: true,
            local_flush_started: false,
        }
    }

    /// A round with no remote participants and no bridge starts at
    /// `remaining == 1`; its local flush is due immediately.
    pub fn flush_due_at_start(&mut self) -> bool {
        if self.remaining == 1 && !self.local_flush_started {
            self.local_flush_started = true;
            return true;
        }
        false
    }

    pub fn awaits(&self, id: ParticipantId) -> bool {
        self.awaiting.contains(&id)
    }

    pub fn bridge_pending(&self) -> bool {
        self.bridge_pending
    }

    pub fn awaiting_len(&self) -> usize {
        self.awaiting.len()
    }

    pub fn apply(&mut self, source: AckSource) -> AckOutcome {
        if self.remaining == 0 {
            return AckOutcome::Ignored;
        }
        match source {
            AckSource::Participant(id) => {
                if !self.awaiting.remove(&id) {
                    return AckOutcome::Ignored;
                }
            }
            AckSource::Bridge => {
                if !self.bridge_pending {
                    return AckOutcome::Ignored;
                }
                self.bridge_pending = false;
            }
            AckSource::Local => {
                if !self.local_pending {
                    return AckOutcome::Ignored;
                }
                self.local_pending = false;
            }
        }
        self.remaining -= 1;
        debug_assert_eq!(
            self.remaining,
            self.awaiting.len()
                + usize::from(self.bridge_pending)
                + usize::from(self.local_pending),
            "ack counter invariant violated"
        );

        let local_flush_due =
            self.remaining == 1 && self.local_pending && !self.local_flush_started;
        if local_flush_due {
            self.local_flush_started = true;
        }
        AckOutcome::Progressed {
            local_flush_due,
            complete: self.remaining == 0,
        }
    }
}

pub(crate) enum OpCompletion {
    File(Box<dyn FnOnce(PathBuf) + Send>),
    Categories(Box<dyn FnOnce(BTreeSet<String>) + Send>),
}

/// One in-flight ack-counted round with a result sink.
pub(crate) struct PendingOp {
    pub counter: AckCounter,
    pub sink: TraceSink,
    pub categories: BTreeSet<String>,
    pub completion: OpCompletion,
}

/// One in-flight buffer-usage round; no sink, plain aggregation.
pub(crate) struct PercentRound {
    pub counter: AckCounter,
    pub max_percent: f32,
    pub on_result: Box<dyn FnOnce(f32) + Send>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[u64]) -> BTreeSet<ParticipantId> {
        values.iter().map(|v| ParticipantId::new(*v)).collect()
    }

    fn progressed(outcome: AckOutcome) -> (bool, bool) {
        match outcome {
            AckOutcome::Progressed {
                local_flush_due,
                complete,
            } => (local_flush_due, complete),
            AckOutcome::Ignored => panic!("ack should have progressed"),
        }
    }

    #[test]
    fn completes_after_exactly_n_plus_one_decrements_in_any_order() {
        let a = ParticipantId::new(1);
        let b = ParticipantId::new(2);
        let orders = [
            [AckSource::Participant(a), AckSource::Participant(b)],
            [AckSource::Participant(b), AckSource::Participant(a)],
        ];

        for order in orders {
            let mut counter = AckCounter::new(ids(&[1, 2]), false);
            assert!(!counter.flush_due_at_start());

            let mut flush_seen = false;
            for source in order {
                let (flush_due, complete) = progressed(counter.apply(source));
                assert!(!complete);
                if flush_due {
                    assert!(!flush_seen, "flush should trigger once");
                    flush_seen = true;
                }
            }
            assert!(flush_seen, "last remote ack should trigger the flush");

            let (flush_due, complete) = progressed(counter.apply(AckSource::Local));
            assert!(!flush_due);
            assert!(complete);
        }
    }

    #[test]
    fn bridge_counts_as_one_extra_participant() {
        let mut counter = AckCounter::new(ids(&[1]), true);
        assert!(!counter.flush_due_at_start());

        let (flush_due, _) = progressed(counter.apply(AckSource::Participant(ParticipantId::new(1))));
        assert!(!flush_due, "bridge still pending");
        let (flush_due, complete) = progressed(counter.apply(AckSource::Bridge));
        assert!(flush_due);
        assert!(!complete);
        let (_, complete) = progressed(counter.apply(AckSource::Local));
        assert!(complete);
    }

    #[test]
    fn duplicate_and_unknown_acks_are_ignored() {
        let a = ParticipantId::new(1);
        let mut counter = AckCounter::new(ids(&[1]), false);

        progressed(counter.apply(AckSource::Participant(a)));
        assert!(matches!(
            counter.apply(AckSource::Participant(a)),
            AckOutcome::Ignored
        ));
        assert!(matches!(
            counter.apply(AckSource::Participant(ParticipantId::new(9))),
            AckOutcome::Ignored
        ));
        assert!(matches!(counter.apply(AckSource::Bridge), AckOutcome::Ignored));

        let (_, complete) = progressed(counter.apply(AckSource::Local));
        assert!(complete);
        assert!(matches!(counter.apply(AckSource::Local), AckOutcome::Ignored));
    }

    #[test]
    fn participant_free_round_flushes_at_start() {
        let mut counter = AckCounter::new(BTreeSet::new(), false);
        assert!(counter.flush_due_at_start());
        assert!(!counter.flush_due_at_start(), "start flush triggers once");
        let (_, complete) = progressed(counter.apply(AckSource::Local));
        assert!(complete);
    }
}
