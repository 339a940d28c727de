//! Gate rule for gated execution.
//!
//! A gated step may hand over to the next step once its chunks have all been
//! produced. The rule looks only at the distinct statuses of the current step's
//! chunks: the gate opens for `{}` (the step produced nothing) and `{READY}`
//! (every chunk is produced and none has been dispatched yet). Any other set keeps
//! the gate closed, including "everything completed".

use std::collections::BTreeSet;

use crate::chunk::WorkChunkStatus;

/// Outcome of evaluating the gate for one (instance, step) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// The step produced no chunks.
    AdvanceEmpty,
    /// Every chunk of the step is READY.
    AdvanceAllReady,
    Hold,
}

impl GateDecision {
    pub fn evaluate(statuses: &BTreeSet<WorkChunkStatus>) -> Self {
        let mut iter = statuses.iter();
        match (iter.next(), iter.next()) {
            (None, _) => GateDecision::AdvanceEmpty,
            (Some(WorkChunkStatus::Ready), None) => GateDecision::AdvanceAllReady,
            _ => GateDecision::Hold,
        }
    }

    pub fn can_advance(self) -> bool {
        !matches!(self, GateDecision::Hold)
    }
}

/// Convenience wrapper over [`GateDecision::evaluate`].
pub fn can_advance(statuses: &BTreeSet<WorkChunkStatus>) -> bool {
    GateDecision::evaluate(statuses).can_advance()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(statuses: &[WorkChunkStatus]) -> BTreeSet<WorkChunkStatus> {
        statuses.iter().copied().collect()
    }

    #[test]
    fn empty_and_all_ready_open_the_gate() {
        assert_eq!(GateDecision::evaluate(&set(&[])), GateDecision::AdvanceEmpty);
        assert_eq!(
            GateDecision::evaluate(&set(&[WorkChunkStatus::Ready])),
            GateDecision::AdvanceAllReady
        );
    }

    #[test]
    fn all_completed_keeps_the_gate_closed() {
        assert!(!can_advance(&set(&[WorkChunkStatus::Completed])));
    }

    #[test]
    fn ready_mixed_with_in_progress_holds() {
        assert!(!can_advance(&set(&[
            WorkChunkStatus::Ready,
            WorkChunkStatus::InProgress
        ])));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the gate opens iff the set is `{}` or `{READY}`.
        #[test]
        fn gate_opens_only_for_empty_or_ready(
            statuses in prop::collection::btree_set(
                prop::sample::select(WorkChunkStatus::ALL.to_vec()),
                0..=6,
            )
        ) {
            let expected = statuses.is_empty()
                || statuses == set(&[WorkChunkStatus::Ready]);
            prop_assert_eq!(can_advance(&statuses), expected);
        }
    }
}
