//! Composition root for block-hash signing.
//!
//! [Signer] exposes readiness and asynchronous signing to the
//! block-finalization pipeline, composing the hinTS signing context with an
//! optional companion history-proof mechanism. When neither mechanism is
//! enabled it is always ready and delivers a deterministic one-way hash of
//! the block hash instead of a threshold signature.

use commonware_cryptography::{sha256, Digest};
use futures::channel::oneshot;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::aggregator::Aggregation;
use crate::suite::Suite;
use crate::types::{BlockSignature, ConstructionId, NodeId, Scheme, Weight};
use crate::{Config, Error};

/// A companion threshold mechanism whose readiness gates block signing.
pub trait Companion: Send + Sync + 'static {
    /// Returns whether the mechanism can attest the current scheme.
    fn is_ready(&self) -> bool;
}

/// A companion that is always ready; used when history proofs are disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCompanion;

impl Companion for NoCompanion {
    fn is_ready(&self) -> bool {
        true
    }
}

/// Work the host must perform to progress a signing request: compute this
/// node's partial signature over the message and gossip it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request<D: Digest> {
    /// The construction whose scheme signs.
    pub construction: ConstructionId,
    /// The message to sign.
    pub message: D,
}

/// Signs block hashes with whatever threshold mechanisms are enabled.
pub struct Signer<S: Suite, D: Digest, C: Companion = NoCompanion> {
    enabled: bool,
    threshold: (u64, u64),
    companion: Option<C>,

    crs: Option<S::Crs>,
    scheme: Option<(ConstructionId, Scheme<S>)>,
    pending: BTreeMap<D, Aggregation<S, D>>,
}

impl<S: Suite, D: Digest, C: Companion> Signer<S, D, C> {
    /// Create a signer. `companion` should be set exactly when the history
    /// mechanism is enabled.
    pub fn new(config: &Config, companion: Option<C>) -> Self {
        Self {
            enabled: config.hints_enabled,
            threshold: config.signing_threshold,
            companion,
            crs: None,
            scheme: None,
            pending: BTreeMap::new(),
        }
    }

    /// Adopt a completed construction's scheme for signing.
    ///
    /// Called at bootstrap completion, at roster handoff, and when restarting
    /// from state that already holds a complete construction. Pending
    /// aggregations under the previous scheme are dropped.
    pub fn adopt(&mut self, construction: ConstructionId, scheme: Scheme<S>, crs: S::Crs) {
        self.pending.clear();
        self.crs = Some(crs);
        self.scheme = Some((construction, scheme));
        info!(construction, "signing context ready");
    }

    /// Returns whether every enabled mechanism is ready to sign.
    pub fn is_ready(&self) -> bool {
        let hints_ready = !self.enabled || self.scheme.is_some();
        let companion_ready = self.companion.as_ref().is_none_or(|c| c.is_ready());
        hints_ready && companion_ready
    }

    /// The scheme/epoch identifier callers need to validate a previously
    /// produced aggregate signature.
    pub fn active_scheme(&self) -> Option<ConstructionId> {
        self.scheme.as_ref().map(|(construction, _)| *construction)
    }

    /// The currently adopted verification key.
    pub fn active_verification_key(&self) -> Option<&S::VerificationKey> {
        self.scheme.as_ref().map(|(_, scheme)| &scheme.verification)
    }

    /// Begin signing a block hash, weighting signers by the current roster.
    ///
    /// Fails fast when not ready. Returns a receiver that resolves once
    /// verified partial-signature weight strictly exceeds the configured
    /// threshold, and the partial-signing work the host must dispatch (absent
    /// in placeholder mode). Requests for a message already being signed
    /// share its aggregation.
    pub fn sign(
        &mut self,
        weights: &BTreeMap<NodeId, Weight>,
        message: D,
    ) -> Result<(oneshot::Receiver<BlockSignature<S>>, Option<Request<D>>), Error> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        if !self.enabled {
            let (sender, receiver) = oneshot::channel();
            let _ = sender.send(BlockSignature::Placeholder(sha256::hash(message.as_ref())));
            return Ok((receiver, None));
        }
        let (construction, scheme) = self.scheme.as_ref().expect("ready signer has a scheme");
        let crs = self.crs.as_ref().expect("ready signer has a CRS");
        let aggregation = self.pending.entry(message).or_insert_with(|| {
            Aggregation::new(
                message,
                crs.clone(),
                scheme.aggregation.clone(),
                scheme.verification.clone(),
                scheme.parties.clone(),
                weights.clone(),
                self.threshold.0,
                self.threshold.1,
            )
        });
        let receiver = aggregation.subscribe();
        Ok((
            receiver,
            Some(Request {
                construction: *construction,
                message,
            }),
        ))
    }

    /// Incorporate a gossiped partial signature.
    ///
    /// Partials for constructions other than the active one are rejected;
    /// partials for messages with no in-flight aggregation (including
    /// aggregations already completed) are dropped.
    pub fn ingest_partial(
        &mut self,
        creator: NodeId,
        construction: ConstructionId,
        message: D,
        partial: S::Partial,
    ) -> Result<(), Error> {
        let Some((active, _)) = self.scheme.as_ref() else {
            return Err(Error::NotReady);
        };
        if construction != *active {
            return Err(Error::ConstructionMismatch {
                expected: *active,
                actual: construction,
            });
        }
        let Some(aggregation) = self.pending.get_mut(&message) else {
            debug!(creator, "dropping partial signature for unknown message");
            return Ok(());
        };
        if aggregation.ingest(creator, partial)? {
            self.pending.remove(&message);
        }
        Ok(())
    }
}
