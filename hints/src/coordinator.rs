//! Per-construction state machine.
//!
//! A [Coordinator] owns one construction's progress from CRS bootstrap
//! through key collection and the preprocessing vote to completion. It is a
//! pure function of persisted state, consensus time, and the roster
//! transition: the in-memory instance is a performance cache that can be
//! rebuilt from scratch after a restart without affecting correctness.
//!
//! Background cryptographic work never runs on the consensus-processing
//! path. Instead, [Coordinator::advance] returns [Dispatch] values
//! describing the work this node should perform; the host executes them on
//! worker tasks and feeds the results back in as gossiped records via the
//! ingestion methods, which every node (originator included) applies
//! identically.

use commonware_cryptography::Digest;
use std::collections::BTreeMap;
use std::time::SystemTime;
use tracing::{debug, info};

use crate::crs::{Action, Ceremony};
use crate::preprocessing::Tally;
use crate::registry::Registry;
use crate::suite::Suite;
use crate::types::{
    Construction, ConstructionId, CrsStage, NodeId, PartyId, Phase, RosterTransition, Scheme,
    State, Vote, Weight,
};
use crate::{party_size, Config, Error};

/// Background work this node should perform for a construction.
///
/// Each value is dispatched at most once per phase entry (or per CRS
/// contribution window), never once per invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch<S: Suite> {
    /// Mix 256 bits of fresh entropy into the given CRS and gossip the
    /// updated CRS with its proof.
    ContributeCrs {
        /// The CRS to update.
        crs: S::Crs,
    },
    /// Compute this node's hints key for its party slot and gossip it.
    PublishKey {
        /// The frozen CRS.
        crs: S::Crs,
        /// The party slot this node holds.
        party: PartyId,
        /// The construction's party size.
        parties: u32,
    },
    /// Run preprocessing over the validated key snapshot and gossip a vote
    /// for its output.
    Preprocess {
        /// The construction the vote is for.
        construction: ConstructionId,
        /// The frozen CRS.
        crs: S::Crs,
        /// Validated hints keys by party id.
        keys: BTreeMap<PartyId, S::HintsKey>,
        /// Weights by party id, with the same key set as `keys`.
        weights: BTreeMap<PartyId, Weight>,
        /// The construction's party size.
        parties: u32,
    },
}

/// Advances one construction toward completion.
pub struct Coordinator<S: Suite, D: Digest> {
    me: NodeId,
    config: Config,
    construction: ConstructionId,
    transition: RosterTransition<D>,
    parties: u32,

    ceremony: Ceremony<S>,
    registry: Registry<S>,
    tally: Tally<S>,

    contributed_crs: bool,
    published_key: bool,
    preprocessed: bool,
}

impl<S: Suite, D: Digest> Coordinator<S, D> {
    /// Create a coordinator for the given construction, replaying any key
    /// publications and votes already in state.
    ///
    /// Replay makes the coordinator rebuildable after a restart; the only
    /// cost of losing the in-memory instance is re-validating the replayed
    /// material.
    pub fn new(me: NodeId, config: Config, construction: &Construction<S, D>, state: &State<S, D>) -> Self {
        let parties = party_size(construction.transition.target_weights.len() as u32);
        let targets = construction
            .transition
            .target_weights
            .keys()
            .copied()
            .collect();
        let mut coordinator = Self {
            me,
            ceremony: Ceremony::new(&config),
            config,
            construction: construction.id,
            transition: construction.transition.clone(),
            parties,
            registry: Registry::new(parties, targets),
            tally: Tally::new(),
            contributed_crs: false,
            published_key: false,
            preprocessed: false,
        };

        // Replay published keys adopted before this construction's
        // preprocessing cutoff (all of them, if preprocessing has not
        // started).
        if let Some(crs) = state.crs.as_ref().filter(|crs| crs.stage == CrsStage::Complete) {
            let cutoff = match &construction.phase {
                Phase::PreprocessingVote {
                    preprocessing_start,
                } => Some(*preprocessing_start),
                Phase::CrsBootstrap | Phase::KeyCollection { .. } => None,
                Phase::Complete(_) | Phase::Abandoned => Some(SystemTime::UNIX_EPOCH),
            };
            for (party, set) in state.keys_for(parties) {
                if cutoff.is_some_and(|cutoff| set.adopted_at > cutoff) {
                    continue;
                }
                let _ = coordinator.registry.submit(
                    &crs.crs,
                    &coordinator.transition,
                    set.node,
                    party,
                    set.key,
                    set.adopted_at,
                );
            }
        }

        // Replay votes; node-id order is deterministic and adoption is
        // re-checked on the next ingestion or advance.
        for (node, vote) in state.votes_for(construction.id) {
            let _ = coordinator.tally.register(node, vote);
        }

        coordinator
    }

    /// The id of the construction this coordinator advances.
    pub fn id(&self) -> ConstructionId {
        self.construction
    }

    /// The party size of the construction's target roster.
    pub fn parties(&self) -> u32 {
        self.parties
    }

    /// Returns whether this coordinator targets the given transition.
    pub fn targets(&self, transition: &RosterTransition<D>) -> bool {
        self.transition.source == transition.source && self.transition.target == transition.target
    }

    /// Advance the construction at consensus time `now`.
    ///
    /// Idempotent: calling it again with the same state and time persists no
    /// further transitions and dispatches no duplicate work. `is_active`
    /// gates dispatch only; an inactive node still applies every state
    /// transition.
    pub fn advance(
        &mut self,
        now: SystemTime,
        state: &mut State<S, D>,
        is_active: bool,
    ) -> Vec<Dispatch<S>> {
        let Some(crs) = state.crs.as_mut() else {
            return Vec::new();
        };

        // Until the ceremony completes, the construction sits in CRS
        // bootstrap and the only work is contributing to the CRS.
        if crs.stage != CrsStage::Complete {
            match self
                .ceremony
                .advance(now, &self.transition, crs, self.me, is_active)
            {
                Action::Contribute if !self.contributed_crs => {
                    self.contributed_crs = true;
                    return vec![Dispatch::ContributeCrs {
                        crs: crs.crs.clone(),
                    }];
                }
                Action::Restarted => {
                    self.contributed_crs = false;
                }
                _ => {}
            }
            return Vec::new();
        }
        let crs = crs.crs.clone();

        // The CRS froze: leave bootstrap.
        if matches!(self.phase(state), Phase::CrsBootstrap) {
            let grace = if self.transition.is_bootstrap() {
                self.config.bootstrap_key_grace_period
            } else {
                self.config.transition_key_grace_period
            };
            self.set_phase(
                state,
                Phase::KeyCollection {
                    grace_period_end: now + grace,
                },
            );
            info!(
                construction = self.construction,
                "CRS frozen, collecting hints keys"
            );
        }

        match self.phase(state).clone() {
            Phase::KeyCollection { grace_period_end } => {
                if self.should_start_preprocessing(now, grace_period_end) {
                    self.set_phase(
                        state,
                        Phase::PreprocessingVote {
                            preprocessing_start: now,
                        },
                    );
                    info!(
                        construction = self.construction,
                        "key collection closed, starting preprocessing"
                    );
                    self.dispatch_preprocessing(now, crs, is_active)
                } else {
                    self.dispatch_key_publication(crs, is_active)
                }
            }
            Phase::PreprocessingVote {
                preprocessing_start,
            } => {
                // Votes replayed when this coordinator was rebuilt may
                // already carry adoption weight.
                if self.try_adopt(now, state) {
                    return Vec::new();
                }
                self.dispatch_preprocessing(preprocessing_start, crs, is_active)
            }
            Phase::CrsBootstrap | Phase::Complete(_) | Phase::Abandoned => Vec::new(),
        }
    }

    /// Verify and adopt a CRS contribution.
    pub fn ingest_crs(
        &mut self,
        now: SystemTime,
        state: &mut State<S, D>,
        contributor: NodeId,
        crs: &S::Crs,
        proof: &S::Proof,
    ) -> Result<(), Error> {
        let crs_state = state.crs.as_mut().ok_or(Error::CeremonyIncomplete)?;
        self.ceremony
            .ingest(now, &self.transition, crs_state, contributor, crs, proof)
    }

    /// Validate and record a hints key publication.
    ///
    /// A key arriving after preprocessing started is recorded with its
    /// adoption time and simply falls outside the snapshot cutoff; it may
    /// still serve a later construction with the same party size.
    pub fn ingest_key(
        &mut self,
        now: SystemTime,
        state: &mut State<S, D>,
        node: NodeId,
        party: PartyId,
        parties: u32,
        key: S::HintsKey,
    ) -> Result<(), Error> {
        if parties != self.parties {
            return Err(Error::PartyCountMismatch {
                expected: self.parties,
                actual: parties,
            });
        }
        let crs = state
            .crs
            .as_ref()
            .filter(|crs| crs.stage == CrsStage::Complete)
            .ok_or(Error::CeremonyIncomplete)?
            .crs
            .clone();
        if !matches!(
            self.phase(state),
            Phase::KeyCollection { .. } | Phase::PreprocessingVote { .. }
        ) {
            debug!(node, "ignoring hints key outside collection");
            return Ok(());
        }
        self.registry
            .submit(&crs, &self.transition, node, party, key, now)?;
        Ok(())
    }

    /// Record a preprocessing vote and adopt its output if it carries a
    /// strong minority of source-roster weight.
    pub fn ingest_vote(
        &mut self,
        now: SystemTime,
        state: &mut State<S, D>,
        node: NodeId,
        construction: ConstructionId,
        vote: Vote<S>,
    ) -> Result<(), Error> {
        if construction != self.construction {
            return Err(Error::ConstructionMismatch {
                expected: self.construction,
                actual: construction,
            });
        }
        if self.phase(state).is_terminal() {
            debug!(node, construction, "ignoring vote for settled construction");
            return Ok(());
        }
        if transition_weight_of(&self.transition, node) == 0 {
            return Err(Error::UnknownNode(node));
        }
        self.tally.register(node, vote)?;
        self.try_adopt(now, state);
        Ok(())
    }

    /// Complete the construction if any voted output carries a strong
    /// minority of source-roster weight.
    fn try_adopt(&mut self, now: SystemTime, state: &mut State<S, D>) -> bool {
        let Some((aggregation, verification)) = self.tally.adopted(&self.transition) else {
            return false;
        };
        let scheme = Scheme {
            aggregation,
            verification,
            parties: self.registry.assignments(),
            completed_at: now,
        };
        self.set_phase(state, Phase::Complete(scheme));
        info!(
            construction = self.construction,
            "completed hinTS scheme for construction"
        );
        true
    }

    /// The vote this node should gossip for its preprocessing output:
    /// congruent with the earliest identical vote when one exists, otherwise
    /// the output itself.
    pub fn vote_for(
        &self,
        aggregation: S::AggregationKey,
        verification: S::VerificationKey,
    ) -> Vote<S> {
        match self.tally.congruent_with(&aggregation, &verification) {
            Some(node) => Vote::Congruent { node },
            None => Vote::Keys {
                aggregation,
                verification,
            },
        }
    }

    /// Abandon the construction: a different roster transition superseded
    /// it. Complete constructions are left untouched.
    pub fn abandon(&mut self, state: &mut State<S, D>) {
        if self.phase(state).is_terminal() {
            return;
        }
        self.set_phase(state, Phase::Abandoned);
        info!(construction = self.construction, "abandoned construction");
    }

    fn phase<'a>(&self, state: &'a State<S, D>) -> &'a Phase<S> {
        &state
            .constructions
            .get(&self.construction)
            .expect("construction missing from state")
            .phase
    }

    fn set_phase(&self, state: &mut State<S, D>, phase: Phase<S>) {
        state
            .constructions
            .get_mut(&self.construction)
            .expect("construction missing from state")
            .phase = phase;
    }

    /// Deterministic policy choosing when to close key collection.
    fn should_start_preprocessing(&self, now: SystemTime, grace_period_end: SystemTime) -> bool {
        // If every target-roster node already published, there is nothing
        // left to wait for.
        if self.registry.all_published() {
            info!(
                construction = self.construction,
                "all nodes have published hints keys"
            );
            return true;
        }
        now >= grace_period_end
    }

    fn dispatch_key_publication(&mut self, crs: S::Crs, is_active: bool) -> Vec<Dispatch<S>> {
        if !is_active || self.published_key || !self.transition.target_includes(self.me) {
            return Vec::new();
        }
        // Skip if this node's key is already in the registry (e.g. replayed
        // after a restart).
        if self.registry.contains_node(self.me) {
            return Vec::new();
        }
        let Some(party) = self.registry.expected_party(self.me) else {
            return Vec::new();
        };
        self.published_key = true;
        vec![Dispatch::PublishKey {
            crs,
            party,
            parties: self.parties,
        }]
    }

    fn dispatch_preprocessing(
        &mut self,
        cutoff: SystemTime,
        crs: S::Crs,
        is_active: bool,
    ) -> Vec<Dispatch<S>> {
        if !is_active || self.preprocessed || self.tally.voted(self.me) {
            return Vec::new();
        }
        let (keys, weights) = self.registry.snapshot_at(cutoff, &self.transition);
        if keys.is_empty() {
            // Nothing to preprocess; the construction stalls until the next
            // roster transition supersedes it.
            return Vec::new();
        }
        self.preprocessed = true;
        vec![Dispatch::Preprocess {
            construction: self.construction,
            crs,
            keys,
            weights,
            parties: self.parties,
        }]
    }
}

/// Weight of a node in either roster of the transition (source preferred).
fn transition_weight_of<D: Digest>(transition: &RosterTransition<D>, node: NodeId) -> Weight {
    let weight = transition.source_weight(node);
    if weight > 0 {
        weight
    } else {
        transition.target_weight(node)
    }
}
