//! Collects, verifies, and aggregates partial signatures for one message.
//!
//! Each signing request gets its own [Aggregation]. Partial signatures are
//! verified individually against the construction's CRS and the signer's
//! public material in the aggregation key before their weight counts; once
//! accumulated verified weight strictly exceeds the configured fraction of
//! total roster weight, the partials are aggregated and every waiter is
//! resolved. Partials arriving after that point are discarded.

use commonware_cryptography::Digest;
use futures::channel::oneshot;
use std::collections::BTreeMap;
use tracing::debug;

use crate::suite::Suite;
use crate::types::{exceeds_fraction, BlockSignature, NodeId, PartyId, Weight};
use crate::Error;

/// An in-flight threshold-signing attempt over one message.
pub struct Aggregation<S: Suite, D: Digest> {
    message: D,
    crs: S::Crs,
    aggregation: S::AggregationKey,
    verification: S::VerificationKey,
    parties: BTreeMap<NodeId, PartyId>,
    weights: BTreeMap<NodeId, Weight>,
    total: Weight,
    numerator: u64,
    denominator: u64,

    partials: BTreeMap<PartyId, S::Partial>,
    weight: Weight,
    waiters: Vec<oneshot::Sender<BlockSignature<S>>>,
    done: bool,
}

impl<S: Suite, D: Digest> Aggregation<S, D> {
    /// Create an aggregation for `message` under the given scheme, weighting
    /// signers by the current roster.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message: D,
        crs: S::Crs,
        aggregation: S::AggregationKey,
        verification: S::VerificationKey,
        parties: BTreeMap<NodeId, PartyId>,
        weights: BTreeMap<NodeId, Weight>,
        numerator: u64,
        denominator: u64,
    ) -> Self {
        let total = weights.values().sum();
        Self {
            message,
            crs,
            aggregation,
            verification,
            parties,
            weights,
            total,
            numerator,
            denominator,
            partials: BTreeMap::new(),
            weight: 0,
            waiters: Vec::new(),
            done: false,
        }
    }

    /// The message being signed.
    pub fn message(&self) -> &D {
        &self.message
    }

    /// Returns whether the threshold was reached and waiters resolved.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Register a waiter for the aggregate signature.
    pub fn subscribe(&mut self) -> oneshot::Receiver<BlockSignature<S>> {
        let (sender, receiver) = oneshot::channel();
        self.waiters.push(sender);
        receiver
    }

    /// Verify and incorporate a node's partial signature.
    ///
    /// Returns whether this partial completed the aggregation. Partials from
    /// unknown signers or failing verification are rejected; partials after
    /// completion are discarded.
    pub fn ingest(&mut self, node: NodeId, partial: S::Partial) -> Result<bool, Error> {
        if self.done {
            debug!(node, "discarding partial signature after threshold");
            return Ok(false);
        }
        let party = *self.parties.get(&node).ok_or(Error::UnknownSigner(node))?;
        if self.partials.contains_key(&party) {
            debug!(node, party, "ignoring duplicate partial signature");
            return Ok(false);
        }
        if !S::verify_partial(
            &self.crs,
            &partial,
            self.message.as_ref(),
            &self.aggregation,
            party,
        ) {
            return Err(Error::InvalidPartial(node));
        }
        self.partials.insert(party, partial);
        self.weight += self.weights.get(&node).copied().unwrap_or(0);
        if !exceeds_fraction(self.weight, self.total, self.numerator, self.denominator) {
            return Ok(false);
        }
        self.done = true;
        let signature = S::aggregate(
            &self.crs,
            &self.aggregation,
            &self.verification,
            &self.partials,
        );
        for waiter in self.waiters.drain(..) {
            // A dropped receiver just means the caller stopped waiting.
            let _ = waiter.send(BlockSignature::Hints(signature.clone()));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{signing_fixture, MockSuite};
    use crate::suite::Suite as _;
    use commonware_cryptography::sha256;

    #[test]
    fn test_threshold_is_strict() {
        // Four unit-weight signers at threshold 1/2: two partials carry
        // exactly half the weight and must not complete; a third does.
        let fixture = signing_fixture(4);
        let message = sha256::hash(b"block");
        let mut aggregation = Aggregation::<MockSuite, _>::new(
            message,
            fixture.crs.clone(),
            fixture.aggregation.clone(),
            fixture.verification.clone(),
            fixture.parties.clone(),
            fixture.weights.clone(),
            1,
            2,
        );
        let mut receiver = aggregation.subscribe();

        for (index, (node, key)) in fixture.keys.iter().take(2).enumerate() {
            let partial = MockSuite::partial_sign(message.as_ref(), key);
            let completed = aggregation.ingest(*node, partial).unwrap();
            assert!(!completed, "partial {index} must not complete");
        }
        assert!(receiver.try_recv().unwrap().is_none());

        let (node, key) = fixture.keys.iter().nth(2).unwrap();
        let partial = MockSuite::partial_sign(message.as_ref(), key);
        assert!(aggregation.ingest(*node, partial).unwrap());

        let signature = receiver.try_recv().unwrap().unwrap();
        let BlockSignature::Hints(signature) = signature else {
            panic!("expected hinTS signature");
        };
        assert!(MockSuite::verify_aggregate(
            &signature,
            message.as_ref(),
            &fixture.verification,
            1,
            2
        ));
        // At exactly one half the verifier must also reject.
        assert!(!MockSuite::verify_aggregate(
            &signature,
            message.as_ref(),
            &fixture.verification,
            3,
            4
        ));
    }

    #[test]
    fn test_rejects_invalid_and_unknown() {
        let fixture = signing_fixture(4);
        let message = sha256::hash(b"block");
        let mut aggregation = Aggregation::<MockSuite, _>::new(
            message,
            fixture.crs.clone(),
            fixture.aggregation.clone(),
            fixture.verification.clone(),
            fixture.parties.clone(),
            fixture.weights.clone(),
            1,
            2,
        );

        // A partial over a different message fails verification.
        let (node, key) = fixture.keys.iter().next().unwrap();
        let wrong = MockSuite::partial_sign(sha256::hash(b"other").as_ref(), key);
        assert!(matches!(
            aggregation.ingest(*node, wrong),
            Err(Error::InvalidPartial(_))
        ));

        // A signer outside the scheme is rejected.
        let partial = MockSuite::partial_sign(message.as_ref(), key);
        assert!(matches!(
            aggregation.ingest(999, partial),
            Err(Error::UnknownSigner(999))
        ));
    }

    #[test]
    fn test_discards_after_completion() {
        let fixture = signing_fixture(4);
        let message = sha256::hash(b"block");
        let mut aggregation = Aggregation::<MockSuite, _>::new(
            message,
            fixture.crs.clone(),
            fixture.aggregation.clone(),
            fixture.verification.clone(),
            fixture.parties.clone(),
            fixture.weights.clone(),
            1,
            2,
        );
        let mut nodes = fixture.keys.iter();
        for _ in 0..3 {
            let (node, key) = nodes.next().unwrap();
            let partial = MockSuite::partial_sign(message.as_ref(), key);
            aggregation.ingest(*node, partial).unwrap();
        }
        assert!(aggregation.is_done());

        // The fourth partial is discarded without error.
        let (node, key) = nodes.next().unwrap();
        let partial = MockSuite::partial_sign(message.as_ref(), key);
        assert!(!aggregation.ingest(*node, partial).unwrap());
    }
}
