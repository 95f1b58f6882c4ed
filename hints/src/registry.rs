//! Collects and validates one hints key per party for a construction.
//!
//! Party ids are assigned to target-roster nodes by sorting the unassigned
//! node ids and unused party ids ascending and matching them by index. The
//! assignment a node receives is therefore independent of the order in which
//! nodes publish their keys: after any prefix of assignments, the remaining
//! lists still pair the same way.

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use commonware_cryptography::Digest;
use tracing::{debug, warn};

use crate::suite::Suite;
use crate::types::{NodeId, PartyId, RosterTransition, Weight};
use crate::Error;

/// A recorded key publication, kept whether or not the key validated so the
/// publisher's party slot is consumed either way.
#[derive(Clone, Debug)]
struct Validation<S: Suite> {
    key: S::HintsKey,
    valid: bool,
    adopted_at: SystemTime,
}

/// Validates and retains candidate hints keys for one construction.
pub struct Registry<S: Suite> {
    parties: u32,
    targets: BTreeSet<NodeId>,

    node_parties: BTreeMap<NodeId, PartyId>,
    party_nodes: BTreeMap<PartyId, NodeId>,
    validations: BTreeMap<PartyId, Validation<S>>,
}

impl<S: Suite> Registry<S> {
    /// Create a registry for a construction with the given party size and
    /// target-roster nodes.
    pub fn new(parties: u32, targets: BTreeSet<NodeId>) -> Self {
        Self {
            parties,
            targets,
            node_parties: BTreeMap::new(),
            party_nodes: BTreeMap::new(),
            validations: BTreeMap::new(),
        }
    }

    /// The party id the given node holds (or would be assigned next).
    ///
    /// Party id `0` is never assigned; it denotes the absent party.
    pub fn expected_party(&self, node: NodeId) -> Option<PartyId> {
        if !self.targets.contains(&node) {
            return None;
        }
        if let Some(party) = self.node_parties.get(&node) {
            return Some(*party);
        }
        let position = self
            .targets
            .iter()
            .filter(|candidate| !self.node_parties.contains_key(candidate))
            .position(|candidate| *candidate == node)?;
        (1..self.parties)
            .filter(|party| !self.party_nodes.contains_key(party))
            .nth(position)
    }

    /// Verify and record a key publication.
    ///
    /// Returns `Ok(true)` when a new valid key was accepted, `Ok(false)` for
    /// an idempotent re-submission of an already accepted key. A key that
    /// fails validation still consumes the publisher's party slot so the
    /// assignment stays order-free, but contributes no weight.
    pub fn submit<D: Digest>(
        &mut self,
        crs: &S::Crs,
        transition: &RosterTransition<D>,
        node: NodeId,
        party: PartyId,
        key: S::HintsKey,
        adopted_at: SystemTime,
    ) -> Result<bool, Error> {
        if !transition.target_includes(node) {
            return Err(Error::UnknownNode(node));
        }
        let expected = self.expected_party(node).ok_or(Error::UnknownNode(node))?;
        if party != expected {
            return Err(Error::UnexpectedParty {
                node,
                expected,
                actual: party,
            });
        }
        if let Some(existing) = self.validations.get(&party) {
            if existing.key == key {
                debug!(node, party, "ignoring duplicate key publication");
                return Ok(false);
            }
            return Err(Error::KeyAlreadyRegistered(party));
        }
        let valid = S::validate_hints_key(crs, &key, party, self.parties);
        self.node_parties.insert(node, party);
        self.party_nodes.insert(party, node);
        self.validations.insert(
            party,
            Validation {
                key,
                valid,
                adopted_at,
            },
        );
        if valid {
            debug!(node, party, "accepted hints key");
            Ok(true)
        } else {
            warn!(node, party, "hints key failed validation");
            Err(Error::InvalidKey(party))
        }
    }

    /// Returns whether every target-roster node has published a key.
    pub fn all_published(&self) -> bool {
        self.node_parties.len() == self.targets.len()
    }

    /// Weight of the target-roster nodes whose valid keys were adopted at or
    /// before `cutoff`.
    pub fn valid_weight_at<D: Digest>(
        &self,
        cutoff: SystemTime,
        transition: &RosterTransition<D>,
    ) -> Weight {
        self.validations
            .iter()
            .filter(|(_, validation)| validation.valid && validation.adopted_at <= cutoff)
            .map(|(party, _)| {
                self.party_nodes
                    .get(party)
                    .map_or(0, |node| transition.target_weight(*node))
            })
            .sum()
    }

    /// The validated key snapshot at `cutoff`, as direct input to
    /// preprocessing: keys and weights by party id, in ascending party
    /// order. Ordering is a correctness requirement since the preprocessing
    /// output depends on it.
    pub fn snapshot_at<D: Digest>(
        &self,
        cutoff: SystemTime,
        transition: &RosterTransition<D>,
    ) -> (BTreeMap<PartyId, S::HintsKey>, BTreeMap<PartyId, Weight>) {
        let mut keys = BTreeMap::new();
        let mut weights = BTreeMap::new();
        for (party, validation) in &self.validations {
            if !validation.valid || validation.adopted_at > cutoff {
                continue;
            }
            let Some(node) = self.party_nodes.get(party) else {
                continue;
            };
            keys.insert(*party, validation.key.clone());
            weights.insert(*party, transition.target_weight(*node));
        }
        (keys, weights)
    }

    /// The node-to-party assignments recorded so far.
    pub fn assignments(&self) -> BTreeMap<NodeId, PartyId> {
        self.node_parties.clone()
    }

    /// Returns whether the given node has a recorded publication.
    pub fn contains_node(&self, node: NodeId) -> bool {
        self.node_parties.contains_key(&node)
    }

    /// The party size this registry was built for.
    pub fn parties(&self) -> u32 {
        self.parties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{transition, MockSuite};
    use std::time::{Duration, UNIX_EPOCH};

    fn at(seconds: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(seconds)
    }

    #[test]
    fn test_assignment_is_order_free() {
        // Nodes 7, 9, 12 with party size 4: 7 -> 1, 9 -> 2, 12 -> 3, in
        // whatever order keys arrive.
        let targets: BTreeSet<NodeId> = [7, 9, 12].into_iter().collect();
        let mut registry = Registry::<MockSuite>::new(8, targets.clone());
        assert_eq!(registry.expected_party(9), Some(2));
        registry.node_parties.insert(9, 2);
        registry.party_nodes.insert(2, 9);
        assert_eq!(registry.expected_party(7), Some(1));
        assert_eq!(registry.expected_party(12), Some(3));
        assert_eq!(registry.expected_party(5), None);
    }

    #[test]
    fn test_submit_validates_and_dedupes() {
        let transition = transition(&[(1, 10), (2, 20), (3, 30)], &[(1, 10), (2, 20), (3, 30)]);
        let crs = MockSuite::genesis_crs(8);
        let mut registry = Registry::<MockSuite>::new(8, [1, 2, 3].into_iter().collect());

        let sk = MockSuite::private_key(42);
        let key = MockSuite::hints_for(&crs, &sk, 1, 8);
        assert!(registry
            .submit(&crs, &transition, 1, 1, key.clone(), at(1))
            .unwrap());
        // Identical re-submission is a no-op.
        assert!(!registry
            .submit(&crs, &transition, 1, 1, key, at(2))
            .unwrap());
        // A conflicting key for the same party is rejected.
        let other = MockSuite::hints_for(&crs, &MockSuite::private_key(43), 1, 8);
        assert!(matches!(
            registry.submit(&crs, &transition, 1, 1, other, at(3)),
            Err(Error::KeyAlreadyRegistered(1))
        ));

        // A key computed for the wrong party fails validation but consumes
        // the slot.
        let bad = MockSuite::hints_for(&crs, &MockSuite::private_key(44), 3, 8);
        assert!(matches!(
            registry.submit(&crs, &transition, 2, 2, bad, at(4)),
            Err(Error::InvalidKey(2))
        ));
        assert_eq!(registry.valid_weight_at(at(10), &transition), 10);
    }

    #[test]
    fn test_snapshot_respects_cutoff() {
        let transition = transition(&[(1, 1), (2, 1)], &[(1, 1), (2, 1)]);
        let crs = MockSuite::genesis_crs(4);
        let mut registry = Registry::<MockSuite>::new(4, [1, 2].into_iter().collect());

        let first = MockSuite::hints_for(&crs, &MockSuite::private_key(1), 1, 4);
        let second = MockSuite::hints_for(&crs, &MockSuite::private_key(2), 2, 4);
        registry
            .submit(&crs, &transition, 1, 1, first, at(1))
            .unwrap();
        registry
            .submit(&crs, &transition, 2, 2, second, at(5))
            .unwrap();

        let (keys, weights) = registry.snapshot_at(at(3), &transition);
        assert_eq!(keys.len(), 1);
        assert_eq!(weights.get(&1), Some(&1));
        let (keys, _) = registry.snapshot_at(at(5), &transition);
        assert_eq!(keys.len(), 2);
    }
}
