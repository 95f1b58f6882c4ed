//! Tracks the single in-progress construction across roster transitions.
//!
//! [Manager::reconcile] is invoked once per consensus round with the active
//! roster transition. It creates a construction the first time a transition
//! requires one (persisting the construction record so every node agrees
//! exactly which transition is being targeted), rebuilds the in-memory
//! coordinator on demand, and abandons in-flight work the moment a different
//! transition becomes active. Whether a construction was already started is
//! itself answered from replicated state, which is what makes the
//! coordinator a safely re-creatable cache rather than a source of truth.

use commonware_cryptography::Digest;
use commonware_runtime::Metrics as RuntimeMetrics;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, Dispatch};
use crate::crs::Ceremony;
use crate::metrics::Metrics;
use crate::suite::Suite;
use crate::types::{
    Construction, ConstructionId, KeySet, NodeId, Phase, Record, RosterTransition, State,
};
use crate::{party_size, Config, Error};

/// Creates, advances, and abandons construction coordinators.
pub struct Manager<S: Suite, D: Digest> {
    me: NodeId,
    config: Config,
    coordinator: Option<Coordinator<S, D>>,
    metrics: Metrics,
    stopped: bool,
}

impl<S: Suite, D: Digest> Manager<S, D> {
    /// Create a manager for this node, registering metrics with the given
    /// context.
    pub fn new<E: RuntimeMetrics>(context: &E, me: NodeId, config: Config) -> Self {
        Self {
            me,
            config,
            coordinator: None,
            metrics: Metrics::init(context),
            stopped: false,
        }
    }

    /// Advance the protocol one consensus round.
    ///
    /// No-op when a complete construction already exists for `transition`.
    /// Otherwise resolves (creating if necessary) the coordinator for the
    /// transition and advances it, returning the background work this node
    /// should perform.
    pub fn reconcile(
        &mut self,
        transition: &RosterTransition<D>,
        state: &mut State<S, D>,
        now: SystemTime,
        is_active: bool,
    ) -> Vec<Dispatch<S>> {
        if self.stopped || !self.config.hints_enabled {
            return Vec::new();
        }

        // Bootstrap the CRS ceremony the first time hinTS runs.
        if state.crs.is_none() {
            let parties = if self.config.initial_crs_parties > 0 {
                self.config.initial_crs_parties
            } else {
                party_size(transition.target_weights.len() as u32)
            };
            state.crs = Some(Ceremony::<S>::new(&self.config).bootstrap(
                parties,
                transition.first_source_node(),
                now,
            ));
        }

        // Abandon work the moment a different transition becomes active.
        if let Some(coordinator) = &mut self.coordinator {
            if !coordinator.targets(transition) {
                coordinator.abandon(state);
                self.metrics.abandoned.inc();
                self.coordinator = None;
            }
        }

        // Nothing to do if the transition's construction already completed.
        let existing = state
            .construction_for(transition)
            .map(|construction| construction.is_complete());
        match existing {
            Some(true) => {
                self.adopt_if_unset(state);
                return Vec::new();
            }
            Some(false) => {}
            None => {
                let id = state.next_id;
                state.next_id += 1;
                state.constructions.insert(
                    id,
                    Construction {
                        id,
                        transition: transition.clone(),
                        phase: Phase::CrsBootstrap,
                    },
                );
                self.metrics.created.inc();
                info!(construction = id, "started hinTS construction");
            }
        }

        if self.coordinator.is_none() {
            let construction = state
                .construction_for(transition)
                .expect("construction missing after creation");
            self.coordinator = Some(Coordinator::new(
                self.me,
                self.config.clone(),
                construction,
                state,
            ));
        }
        let dispatches = self
            .coordinator
            .as_mut()
            .expect("coordinator missing after creation")
            .advance(now, state, is_active);
        self.adopt_if_unset(state);
        dispatches
    }

    /// Apply a gossiped record to state.
    ///
    /// Partial-signature records belong to the signer, not the lifecycle;
    /// routing one here is an error.
    pub fn ingest(
        &mut self,
        now: SystemTime,
        state: &mut State<S, D>,
        creator: NodeId,
        record: Record<S, D>,
    ) -> Result<(), Error> {
        if self.stopped || !self.config.hints_enabled {
            debug!(creator, "dropping record while stopped");
            return Ok(());
        }
        let result = self.route(now, state, creator, record);
        match &result {
            Ok(()) => {
                self.metrics.accepted.inc();
            }
            Err(err) => {
                self.metrics.rejected.inc();
                warn!(creator, ?err, "rejected record");
            }
        }
        result
    }

    fn route(
        &mut self,
        now: SystemTime,
        state: &mut State<S, D>,
        creator: NodeId,
        record: Record<S, D>,
    ) -> Result<(), Error> {
        match record {
            Record::CrsContribution { crs, proof } => {
                let coordinator = self.coordinator.as_mut().ok_or(Error::NoConstruction)?;
                coordinator.ingest_crs(now, state, creator, &crs, &proof)
            }
            Record::KeyPublication {
                party,
                parties,
                key,
            } => {
                // Persist the key set regardless of the current
                // construction's party size; a later construction with a
                // matching size may reuse it.
                if let Some(existing) = state.keys.get(&(party, parties)) {
                    if existing.node != creator || existing.key != key {
                        return Err(Error::KeyAlreadyRegistered(party));
                    }
                } else {
                    state.keys.insert(
                        (party, parties),
                        KeySet {
                            node: creator,
                            key: key.clone(),
                            adopted_at: now,
                        },
                    );
                }
                let coordinator = self.coordinator.as_mut().ok_or(Error::NoConstruction)?;
                if parties != coordinator.parties() {
                    debug!(
                        creator,
                        parties, "stored hints key for a different party size"
                    );
                    return Ok(());
                }
                coordinator.ingest_key(now, state, creator, party, parties, key)
            }
            Record::Vote { construction, vote } => {
                if state.votes.contains_key(&(construction, creator)) {
                    return Err(Error::DuplicateVote(creator));
                }
                state.votes.insert((construction, creator), vote.clone());
                let coordinator = self.coordinator.as_mut().ok_or(Error::NoConstruction)?;
                let was_complete = state
                    .constructions
                    .get(&construction)
                    .is_some_and(|c| c.is_complete());
                let result = coordinator.ingest_vote(now, state, creator, construction, vote);
                if result.is_ok() {
                    let is_complete = state
                        .constructions
                        .get(&construction)
                        .is_some_and(|c| c.is_complete());
                    if is_complete && !was_complete {
                        self.metrics.completed.inc();
                    }
                    self.adopt_if_unset(state);
                }
                result
            }
            Record::Partial { .. } => Err(Error::UnexpectedRecord),
        }
    }

    /// Swap the signing construction after the network adopts a new roster.
    ///
    /// Returns the id of the newly adopted construction, if the handoff
    /// happened. Overriding an unbroken trust chain (the current signing
    /// construction's target is not the handoff's previous roster) requires
    /// `force_handoffs`.
    pub fn handoff(
        &mut self,
        state: &mut State<S, D>,
        previous: &D,
        adopted: &D,
    ) -> Result<Option<ConstructionId>, Error> {
        let Some(candidate) = state
            .constructions
            .values()
            .filter(|construction| {
                construction.is_complete() && construction.transition.target == *adopted
            })
            .map(|construction| construction.id)
            .next_back()
        else {
            return Ok(None);
        };
        if let Some(current) = state.signing_construction() {
            if current.id == candidate {
                return Ok(None);
            }
            if current.transition.target != *previous && !self.config.force_handoffs {
                return Err(Error::BrokenTrustChain);
            }
        }
        state.signing = Some(candidate);
        self.metrics.signing.set(candidate as i64);
        // Votes for superseded constructions are no longer reachable.
        state.votes.retain(|(construction, _), _| *construction >= candidate);
        info!(construction = candidate, "handed off signing construction");
        Ok(Some(candidate))
    }

    /// Abandon all in-flight work. Used when hinTS is disabled at runtime or
    /// the node is shutting down; replicated state is left untouched.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.coordinator = None;
        info!("stopped hinTS lifecycle");
    }

    /// The vote this node should gossip for a preprocessing output, chosen
    /// by the live coordinator.
    pub fn vote_for(
        &self,
        aggregation: S::AggregationKey,
        verification: S::VerificationKey,
    ) -> Result<crate::types::Vote<S>, Error> {
        let coordinator = self.coordinator.as_ref().ok_or(Error::NoConstruction)?;
        Ok(coordinator.vote_for(aggregation, verification))
    }

    /// Adopt the first completed construction for signing if none is set.
    ///
    /// Later completions (roster transitions) replace it only through
    /// [Manager::handoff].
    fn adopt_if_unset(&mut self, state: &mut State<S, D>) {
        if state.signing.is_some() {
            return;
        }
        let Some(id) = state
            .constructions
            .values()
            .filter(|construction| construction.is_complete())
            .map(|construction| construction.id)
            .next()
        else {
            return;
        };
        state.signing = Some(id);
        self.metrics.signing.set(id as i64);
        info!(construction = id, "adopted signing construction");
    }
}
