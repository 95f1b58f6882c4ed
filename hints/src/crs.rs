//! Ceremony that establishes and evolves the common reference string.
//!
//! The CRS starts at a deterministic genesis value and is then updated node
//! by node: each source-roster node gets a bounded window to mix fresh
//! entropy into the latest adopted CRS and publish a proof of honest
//! contribution. A node that misses its window is skipped; an invalid proof
//! wastes the contributor's turn without advancing the CRS. Once every node
//! has had a window, the ceremony waits out a finalization delay and then
//! freezes the CRS if contributions covering more than two thirds of source
//! weight verified; otherwise the round-robin restarts from the first node.

use commonware_cryptography::Digest;
use std::marker::PhantomData;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::suite::Suite;
use crate::types::{exceeds_two_thirds, CrsStage, CrsState, NodeId, RosterTransition};
use crate::{Config, Error};

/// Outcome of advancing the ceremony one round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing for this node to do.
    Wait,
    /// This node's contribution window is open; it should mix entropy into
    /// the current CRS and publish the update.
    Contribute,
    /// The ceremony restarted from the first node; any per-window dispatch
    /// state may be reset.
    Restarted,
}

/// Drives the CRS ceremony over a persisted [CrsState].
///
/// The ceremony itself is stateless: everything it decides is a function of
/// the persisted state, the roster transition, and consensus time, so any
/// node can rebuild it from scratch after a restart.
pub struct Ceremony<S: Suite> {
    contribution_window: Duration,
    finalization_delay: Duration,

    _suite: PhantomData<S>,
}

impl<S: Suite> Ceremony<S> {
    /// Create a new ceremony with the configured windows.
    pub fn new(config: &Config) -> Self {
        Self {
            contribution_window: config.crs_update_contribution_time,
            finalization_delay: config.crs_finalization_delay,
            _suite: PhantomData,
        }
    }

    /// Bootstrap the ceremony state for a network of `parties` parties,
    /// scheduling the first contributor's window.
    pub fn bootstrap(&self, parties: u32, first: Option<NodeId>, now: SystemTime) -> CrsState<S> {
        info!(parties, "bootstrapping CRS");
        CrsState {
            crs: S::new_crs(parties),
            stage: CrsStage::Gathering,
            contributed: 0,
            next: first,
            deadline: first.map(|_| now + self.contribution_window),
        }
    }

    /// Advance the ceremony at consensus time `now`.
    ///
    /// Returns [Action::Contribute] exactly when this node's own window is
    /// open and it is an active participant. The caller is responsible for
    /// dispatching that work at most once per window.
    pub fn advance<D: Digest>(
        &self,
        now: SystemTime,
        transition: &RosterTransition<D>,
        state: &mut CrsState<S>,
        me: NodeId,
        is_active: bool,
    ) -> Action {
        match state.next {
            None => {
                if self.try_finalize(now, transition, state) {
                    Action::Restarted
                } else {
                    Action::Wait
                }
            }
            Some(node) => {
                if state.deadline.is_some_and(|deadline| now > deadline) {
                    self.move_to_next(now, transition, state, node);
                    Action::Wait
                } else if node == me && is_active {
                    Action::Contribute
                } else {
                    Action::Wait
                }
            }
        }
    }

    /// Verify and adopt a contribution from the scheduled node.
    ///
    /// A valid contribution advances the CRS and credits the contributor's
    /// weight; an invalid one only consumes the contributor's turn. Either
    /// way the window moves to the next node.
    pub fn ingest<D: Digest>(
        &self,
        now: SystemTime,
        transition: &RosterTransition<D>,
        state: &mut CrsState<S>,
        contributor: NodeId,
        crs: &S::Crs,
        proof: &S::Proof,
    ) -> Result<(), Error> {
        if state.stage == CrsStage::Complete {
            return Err(Error::CeremonyComplete);
        }
        let weight = transition.source_weight(contributor);
        if weight == 0 {
            return Err(Error::UnknownContributor(contributor));
        }
        if state.next != Some(contributor) {
            return Err(Error::OutOfTurn(contributor));
        }
        let valid = S::verify_crs_update(&state.crs, crs, proof);
        if valid {
            state.crs = crs.clone();
            state.contributed += weight;
        }
        self.move_to_next(now, transition, state, contributor);
        if valid {
            Ok(())
        } else {
            Err(Error::InvalidContribution(contributor))
        }
    }

    /// If all nodes have had their window, wait out the finalization delay
    /// and either freeze the CRS or restart the round-robin. Returns whether
    /// the ceremony restarted.
    fn try_finalize<D: Digest>(
        &self,
        now: SystemTime,
        transition: &RosterTransition<D>,
        state: &mut CrsState<S>,
    ) -> bool {
        match state.stage {
            CrsStage::Gathering => {
                state.stage = CrsStage::Finalizing;
                state.deadline = Some(now + self.finalization_delay);
                info!("all nodes had a CRS contribution window, waiting for adoption");
                false
            }
            CrsStage::Finalizing => {
                let Some(deadline) = state.deadline else {
                    return false;
                };
                if now <= deadline {
                    return false;
                }
                let total = transition.total_source_weight();
                if exceeds_two_thirds(state.contributed, total) {
                    state.stage = CrsStage::Complete;
                    state.deadline = None;
                    info!(
                        contributed = state.contributed,
                        total, "CRS ceremony complete"
                    );
                    false
                } else {
                    warn!(
                        contributed = state.contributed,
                        total, "insufficient CRS contribution weight, restarting ceremony"
                    );
                    state.stage = CrsStage::Gathering;
                    state.next = transition.first_source_node();
                    state.deadline = Some(now + self.contribution_window);
                    true
                }
            }
            CrsStage::Complete => false,
        }
    }

    /// Open the next contributor's window, or close gathering if `node` was
    /// the last contributor.
    fn move_to_next<D: Digest>(
        &self,
        now: SystemTime,
        transition: &RosterTransition<D>,
        state: &mut CrsState<S>,
        node: NodeId,
    ) {
        match transition.source_node_after(node) {
            Some(next) => {
                state.next = Some(next);
                state.deadline = Some(now + self.contribution_window);
                info!(node = next, "moving on to next CRS contributor");
            }
            None => {
                state.next = None;
                state.deadline = None;
                info!("no remaining CRS contributors to consider");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{transition, MockSuite};
    use crate::suite::Suite as _;
    use std::time::UNIX_EPOCH;

    fn at(seconds: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(seconds)
    }

    fn setup() -> (
        Ceremony<MockSuite>,
        RosterTransition<commonware_cryptography::sha256::Digest>,
        CrsState<MockSuite>,
    ) {
        let ceremony = Ceremony::new(&Config::for_tests());
        let weights: Vec<(NodeId, u64)> = vec![(1, 1), (2, 1), (3, 1)];
        let transition = transition(&weights, &weights);
        let state = ceremony.bootstrap(8, transition.first_source_node(), at(0));
        (ceremony, transition, state)
    }

    #[test]
    fn test_missed_window_skips_contributor() {
        let (ceremony, transition, mut state) = setup();
        assert_eq!(state.next, Some(1));

        // Node 1's window (10s) lapses without a contribution.
        let action = ceremony.advance(at(11), &transition, &mut state, 2, true);
        assert_eq!(action, Action::Wait);
        assert_eq!(state.next, Some(2));

        // Node 2's window is now open for node 2 only.
        let action = ceremony.advance(at(12), &transition, &mut state, 2, true);
        assert_eq!(action, Action::Contribute);
        let action = ceremony.advance(at(12), &transition, &mut state, 3, true);
        assert_eq!(action, Action::Wait);
    }

    #[test]
    fn test_contributions_verify_in_turn() {
        let (ceremony, transition, mut state) = setup();
        let (updated, proof) = MockSuite::update_crs(&state.crs, [1u8; 32]);

        // Only the scheduled contributor may contribute.
        assert!(matches!(
            ceremony.ingest(at(1), &transition, &mut state, 2, &updated, &proof),
            Err(Error::OutOfTurn(2))
        ));
        assert!(matches!(
            ceremony.ingest(at(1), &transition, &mut state, 9, &updated, &proof),
            Err(Error::UnknownContributor(9))
        ));

        ceremony
            .ingest(at(1), &transition, &mut state, 1, &updated, &proof)
            .unwrap();
        assert_eq!(state.crs, updated);
        assert_eq!(state.contributed, 1);
        assert_eq!(state.next, Some(2));
    }

    #[test]
    fn test_invalid_proof_consumes_turn_without_advancing_crs() {
        let (ceremony, transition, mut state) = setup();
        let genesis = state.crs;

        // A proof over the wrong base CRS does not verify.
        let (other, _) = MockSuite::update_crs(&genesis, [9u8; 32]);
        let (updated, proof) = MockSuite::update_crs(&other, [1u8; 32]);
        assert!(matches!(
            ceremony.ingest(at(1), &transition, &mut state, 1, &updated, &proof),
            Err(Error::InvalidContribution(1))
        ));
        assert_eq!(state.crs, genesis);
        assert_eq!(state.contributed, 0);
        // The turn was consumed regardless.
        assert_eq!(state.next, Some(2));
    }

    #[test]
    fn test_restarts_until_weight_sufficient() {
        let (ceremony, transition, mut state) = setup();

        // Only node 1 contributes; nodes 2 and 3 miss their windows.
        let (updated, proof) = MockSuite::update_crs(&state.crs, [1u8; 32]);
        ceremony
            .ingest(at(1), &transition, &mut state, 1, &updated, &proof)
            .unwrap();
        ceremony.advance(at(12), &transition, &mut state, 1, true);
        ceremony.advance(at(23), &transition, &mut state, 1, true);
        assert_eq!(state.next, None);

        // Finalization begins, but one third of weight is not enough: the
        // round-robin restarts from the first node.
        ceremony.advance(at(24), &transition, &mut state, 1, true);
        assert_eq!(state.stage, CrsStage::Finalizing);
        let action = ceremony.advance(at(30), &transition, &mut state, 1, true);
        assert_eq!(action, Action::Restarted);
        assert_eq!(state.stage, CrsStage::Gathering);
        assert_eq!(state.next, Some(1));

        // This time every node contributes and the CRS freezes.
        for (round, node) in (1..=3u64).enumerate() {
            let now = at(31 + round as u64);
            let (updated, proof) = MockSuite::update_crs(&state.crs, [node as u8; 32]);
            ceremony
                .ingest(now, &transition, &mut state, node, &updated, &proof)
                .unwrap();
        }
        ceremony.advance(at(35), &transition, &mut state, 1, true);
        ceremony.advance(at(41), &transition, &mut state, 1, true);
        assert_eq!(state.stage, CrsStage::Complete);
        // Contributions accumulate across the restart.
        assert_eq!(state.contributed, 4);
    }
}
