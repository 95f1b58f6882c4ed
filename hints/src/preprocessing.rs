//! Deterministic adoption of a preprocessing output.
//!
//! Different nodes may have validated different key subsets, so their local
//! preprocessing runs can legitimately produce different outputs. Agreement
//! is reached without extra consensus messaging: every node votes for the
//! output it computed (or endorses an earlier identical vote), and the first
//! output whose voters' source-roster weight strictly exceeds one third of
//! total is adopted. Because votes are ingested in consensus order, every
//! node observes the same first crossing.

use commonware_cryptography::Digest;
use std::collections::BTreeMap;

use crate::suite::Suite;
use crate::types::{exceeds_strong_minority, NodeId, RosterTransition, Vote, Weight};
use crate::Error;

/// Accumulates preprocessing votes for one construction.
pub struct Tally<S: Suite> {
    votes: BTreeMap<NodeId, (S::AggregationKey, S::VerificationKey)>,
}

impl<S: Suite> Default for Tally<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Suite> Tally<S> {
    /// Create an empty tally.
    pub fn new() -> Self {
        Self {
            votes: BTreeMap::new(),
        }
    }

    /// Record a node's vote, resolving a congruent vote to the referenced
    /// voter's output.
    pub fn register(&mut self, node: NodeId, vote: Vote<S>) -> Result<(), Error> {
        if self.votes.contains_key(&node) {
            return Err(Error::DuplicateVote(node));
        }
        let resolved = match vote {
            Vote::Keys {
                aggregation,
                verification,
            } => (aggregation, verification),
            Vote::Congruent { node: referenced } => self
                .votes
                .get(&referenced)
                .cloned()
                .ok_or(Error::UnknownCongruentVote(referenced))?,
        };
        self.votes.insert(node, resolved);
        Ok(())
    }

    /// Returns whether the given node has voted.
    pub fn voted(&self, node: NodeId) -> bool {
        self.votes.contains_key(&node)
    }

    /// The lowest-id voter whose output equals the given pair, if any. Used
    /// to emit a congruent vote instead of repeating the key pair.
    pub fn congruent_with(
        &self,
        aggregation: &S::AggregationKey,
        verification: &S::VerificationKey,
    ) -> Option<NodeId> {
        self.votes
            .iter()
            .find(|(_, (a, v))| a == aggregation && v == verification)
            .map(|(node, _)| *node)
    }

    /// The output whose cumulative voter weight strictly exceeds one third
    /// of total source-roster weight, if any.
    ///
    /// Grouping and iteration are over ordered maps, so any two tallies
    /// holding the same votes agree on the adopted pair (or both adopt
    /// none).
    pub fn adopted<D: Digest>(
        &self,
        transition: &RosterTransition<D>,
    ) -> Option<(S::AggregationKey, S::VerificationKey)> {
        let total = transition.total_source_weight();
        let mut grouped: BTreeMap<&(S::AggregationKey, S::VerificationKey), Weight> =
            BTreeMap::new();
        for (node, output) in &self.votes {
            *grouped.entry(output).or_default() += transition.source_weight(*node);
        }
        grouped
            .into_iter()
            .find(|(_, weight)| exceeds_strong_minority(*weight, total))
            .map(|(output, _)| output.clone())
    }
}
