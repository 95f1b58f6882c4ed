//! Types persisted in replicated state or gossiped between nodes.
//!
//! Everything here is encodable with [commonware_codec] so that replay from
//! stored state is exact: the construction phase is a closed tagged union and
//! the full tagged value is persisted, never a projection of it.

use bytes::{Buf, BufMut};
use commonware_codec::{varint::UInt, EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::Digest;
use commonware_utils::SystemTimeExt;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::suite::Suite;

/// Identifies a consensus node. Node ids are sparse and assigned externally
/// by the membership service.
pub type NodeId = u64;

/// Identifies a party within a construction's party size. Party ids are
/// dense; id `0` is reserved for the absent (null) party.
pub type PartyId = u32;

/// Consensus weight of a node.
pub type Weight = u64;

/// Identifies one run of the construction protocol. Ids are monotonically
/// increasing and never reused.
pub type ConstructionId = u64;

/// Returns whether `weight` strictly exceeds one third of `total` (a "strong
/// minority"): enough weight to make a claim trustworthy assuming less than
/// one third of total weight is malicious.
pub fn exceeds_strong_minority(weight: Weight, total: Weight) -> bool {
    3 * (weight as u128) > total as u128
}

/// Returns whether `weight` strictly exceeds two thirds of `total`.
pub fn exceeds_two_thirds(weight: Weight, total: Weight) -> bool {
    3 * (weight as u128) > 2 * (total as u128)
}

/// Returns whether `weight` strictly exceeds `numerator / denominator` of
/// `total`. Equality does not pass.
pub fn exceeds_fraction(weight: Weight, total: Weight, numerator: u64, denominator: u64) -> bool {
    (weight as u128) * (denominator as u128) > (total as u128) * (numerator as u128)
}

/// Writes a [SystemTime] as varint milliseconds since the Unix epoch.
pub(crate) fn write_time(time: &SystemTime, buf: &mut impl BufMut) {
    UInt(time.epoch_millis()).write(buf);
}

/// Reads a [SystemTime] written by [write_time].
pub(crate) fn read_time(buf: &mut impl Buf) -> Result<SystemTime, CodecError> {
    let millis: u64 = UInt::read(buf)?.into();
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

/// Encoded size of a [SystemTime] written by [write_time].
pub(crate) fn time_encode_size(time: &SystemTime) -> usize {
    UInt(time.epoch_millis()).encode_size()
}

fn write_weights(weights: &BTreeMap<NodeId, Weight>, buf: &mut impl BufMut) {
    UInt(weights.len() as u64).write(buf);
    for (node, weight) in weights {
        UInt(*node).write(buf);
        UInt(*weight).write(buf);
    }
}

fn read_weights(buf: &mut impl Buf) -> Result<BTreeMap<NodeId, Weight>, CodecError> {
    let len: u64 = UInt::read(buf)?.into();
    let mut weights = BTreeMap::new();
    for _ in 0..len {
        let node: u64 = UInt::read(buf)?.into();
        let weight: u64 = UInt::read(buf)?.into();
        weights.insert(node, weight);
    }
    Ok(weights)
}

fn weights_encode_size(weights: &BTreeMap<NodeId, Weight>) -> usize {
    let mut size = UInt(weights.len() as u64).encode_size();
    for (node, weight) in weights {
        size += UInt(*node).encode_size() + UInt(*weight).encode_size();
    }
    size
}

/// The move from a source roster to a target roster, supplied externally
/// once per consensus round.
///
/// At genesis the source and target rosters are the same; the bootstrap
/// construction targets that single roster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RosterTransition<D: Digest> {
    /// Hash of the roster the network is operating under.
    pub source: D,
    /// Hash of the roster the network is transitioning to.
    pub target: D,
    /// Weights of the nodes in the source roster.
    pub source_weights: BTreeMap<NodeId, Weight>,
    /// Weights of the nodes in the target roster.
    pub target_weights: BTreeMap<NodeId, Weight>,
}

impl<D: Digest> RosterTransition<D> {
    /// Returns whether this is the genesis (bootstrap) transition.
    pub fn is_bootstrap(&self) -> bool {
        self.source == self.target
    }

    /// Total weight of the source roster.
    pub fn total_source_weight(&self) -> Weight {
        self.source_weights.values().sum()
    }

    /// Total weight of the target roster.
    pub fn total_target_weight(&self) -> Weight {
        self.target_weights.values().sum()
    }

    /// Weight of a node in the source roster (zero if absent).
    pub fn source_weight(&self, node: NodeId) -> Weight {
        self.source_weights.get(&node).copied().unwrap_or(0)
    }

    /// Weight of a node in the target roster (zero if absent).
    pub fn target_weight(&self, node: NodeId) -> Weight {
        self.target_weights.get(&node).copied().unwrap_or(0)
    }

    /// Returns whether the target roster includes the given node.
    pub fn target_includes(&self, node: NodeId) -> bool {
        self.target_weights.contains_key(&node)
    }

    /// The lowest node id in the source roster, where the CRS round-robin
    /// begins.
    pub fn first_source_node(&self) -> Option<NodeId> {
        self.source_weights.keys().next().copied()
    }

    /// The smallest source node id strictly greater than `node`, if any.
    pub fn source_node_after(&self, node: NodeId) -> Option<NodeId> {
        self.source_weights
            .range((Bound::Excluded(node), Bound::Unbounded))
            .next()
            .map(|(id, _)| *id)
    }
}

impl<D: Digest> Write for RosterTransition<D> {
    fn write(&self, buf: &mut impl BufMut) {
        self.source.write(buf);
        self.target.write(buf);
        write_weights(&self.source_weights, buf);
        write_weights(&self.target_weights, buf);
    }
}

impl<D: Digest> Read for RosterTransition<D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let source = D::read(buf)?;
        let target = D::read(buf)?;
        let source_weights = read_weights(buf)?;
        let target_weights = read_weights(buf)?;
        Ok(Self {
            source,
            target,
            source_weights,
            target_weights,
        })
    }
}

impl<D: Digest> EncodeSize for RosterTransition<D> {
    fn encode_size(&self) -> usize {
        self.source.encode_size()
            + self.target.encode_size()
            + weights_encode_size(&self.source_weights)
            + weights_encode_size(&self.target_weights)
    }
}

const CRS_STAGE_GATHERING: u8 = 0;
const CRS_STAGE_FINALIZING: u8 = 1;
const CRS_STAGE_COMPLETE: u8 = 2;

/// Stage of the CRS ceremony.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrsStage {
    /// Contributions are being gathered node by node.
    Gathering,
    /// Every node has had its window; waiting out the finalization delay.
    Finalizing,
    /// The CRS is frozen and usable by constructions.
    Complete,
}

impl Write for CrsStage {
    fn write(&self, buf: &mut impl BufMut) {
        let tag = match self {
            CrsStage::Gathering => CRS_STAGE_GATHERING,
            CrsStage::Finalizing => CRS_STAGE_FINALIZING,
            CrsStage::Complete => CRS_STAGE_COMPLETE,
        };
        buf.put_u8(tag);
    }
}

impl Read for CrsStage {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            CRS_STAGE_GATHERING => Ok(CrsStage::Gathering),
            CRS_STAGE_FINALIZING => Ok(CrsStage::Finalizing),
            CRS_STAGE_COMPLETE => Ok(CrsStage::Complete),
            tag => Err(CodecError::InvalidEnum(tag)),
        }
    }
}

impl EncodeSize for CrsStage {
    fn encode_size(&self) -> usize {
        1
    }
}

/// Persisted state of the CRS ceremony.
///
/// The CRS starts at the deterministic genesis value and advances only when a
/// scheduled contributor's proof verifies; an invalid or missing contribution
/// leaves it unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrsState<S: Suite> {
    /// The latest adopted CRS.
    pub crs: S::Crs,
    /// Current ceremony stage.
    pub stage: CrsStage,
    /// Weight of the source-roster nodes whose contributions verified.
    pub contributed: Weight,
    /// The node whose contribution window is open, if any.
    pub next: Option<NodeId>,
    /// End of the open contribution window (while gathering) or of the
    /// finalization delay (while finalizing).
    pub deadline: Option<SystemTime>,
}

impl<S: Suite> Write for CrsState<S> {
    fn write(&self, buf: &mut impl BufMut) {
        self.crs.write(buf);
        self.stage.write(buf);
        UInt(self.contributed).write(buf);
        match self.next {
            Some(node) => {
                buf.put_u8(1);
                UInt(node).write(buf);
            }
            None => buf.put_u8(0),
        }
        match &self.deadline {
            Some(deadline) => {
                buf.put_u8(1);
                write_time(deadline, buf);
            }
            None => buf.put_u8(0),
        }
    }
}

impl<S: Suite> Read for CrsState<S> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let crs = S::Crs::read(buf)?;
        let stage = CrsStage::read(buf)?;
        let contributed = UInt::read(buf)?.into();
        let next = match u8::read(buf)? {
            0 => None,
            1 => Some(UInt::read(buf)?.into()),
            tag => return Err(CodecError::InvalidEnum(tag)),
        };
        let deadline = match u8::read(buf)? {
            0 => None,
            1 => Some(read_time(buf)?),
            tag => return Err(CodecError::InvalidEnum(tag)),
        };
        Ok(Self {
            crs,
            stage,
            contributed,
            next,
            deadline,
        })
    }
}

impl<S: Suite> EncodeSize for CrsState<S> {
    fn encode_size(&self) -> usize {
        let mut size = self.crs.encode_size() + self.stage.encode_size();
        size += UInt(self.contributed).encode_size();
        size += 1 + self.next.map_or(0, |node| UInt(node).encode_size());
        size += 1 + self.deadline.as_ref().map_or(0, time_encode_size);
        size
    }
}

/// The adopted output of a completed construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scheme<S: Suite> {
    /// Linear-size aggregation key.
    pub aggregation: S::AggregationKey,
    /// Succinct verification key.
    pub verification: S::VerificationKey,
    /// Node-to-party assignments adopted with the keys.
    pub parties: BTreeMap<NodeId, PartyId>,
    /// Consensus time at which the construction completed.
    pub completed_at: SystemTime,
}

impl<S: Suite> Write for Scheme<S> {
    fn write(&self, buf: &mut impl BufMut) {
        self.aggregation.write(buf);
        self.verification.write(buf);
        UInt(self.parties.len() as u64).write(buf);
        for (node, party) in &self.parties {
            UInt(*node).write(buf);
            UInt(*party).write(buf);
        }
        write_time(&self.completed_at, buf);
    }
}

impl<S: Suite> Read for Scheme<S> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let aggregation = S::AggregationKey::read(buf)?;
        let verification = S::VerificationKey::read(buf)?;
        let len: u64 = UInt::read(buf)?.into();
        let mut parties = BTreeMap::new();
        for _ in 0..len {
            let node: u64 = UInt::read(buf)?.into();
            let party: u32 = UInt::read(buf)?.into();
            parties.insert(node, party);
        }
        let completed_at = read_time(buf)?;
        Ok(Self {
            aggregation,
            verification,
            parties,
            completed_at,
        })
    }
}

impl<S: Suite> EncodeSize for Scheme<S> {
    fn encode_size(&self) -> usize {
        let mut size = self.aggregation.encode_size() + self.verification.encode_size();
        size += UInt(self.parties.len() as u64).encode_size();
        for (node, party) in &self.parties {
            size += UInt(*node).encode_size() + UInt(*party).encode_size();
        }
        size + time_encode_size(&self.completed_at)
    }
}

const PHASE_CRS_BOOTSTRAP: u8 = 0;
const PHASE_KEY_COLLECTION: u8 = 1;
const PHASE_PREPROCESSING_VOTE: u8 = 2;
const PHASE_COMPLETE: u8 = 3;
const PHASE_ABANDONED: u8 = 4;

/// Phase of a construction, with the data that phase owns.
///
/// Phases only advance forward, except into [Phase::Abandoned], which is
/// terminal and reachable from any phase other than [Phase::Complete].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Phase<S: Suite> {
    /// Waiting for the network CRS ceremony to complete.
    CrsBootstrap,
    /// Collecting hints keys until the grace period lapses.
    KeyCollection {
        /// Consensus time at which the grace period ends.
        grace_period_end: SystemTime,
    },
    /// Waiting for a preprocessing output to reach a strong minority of
    /// votes.
    PreprocessingVote {
        /// Consensus time at which preprocessing started; only key
        /// publications adopted at or before this instant were considered.
        preprocessing_start: SystemTime,
    },
    /// An aggregation/verification key pair was adopted.
    Complete(Scheme<S>),
    /// Superseded by a later roster transition.
    Abandoned,
}

impl<S: Suite> Phase<S> {
    /// Returns whether the phase can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete(_) | Phase::Abandoned)
    }
}

impl<S: Suite> Write for Phase<S> {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Phase::CrsBootstrap => buf.put_u8(PHASE_CRS_BOOTSTRAP),
            Phase::KeyCollection { grace_period_end } => {
                buf.put_u8(PHASE_KEY_COLLECTION);
                write_time(grace_period_end, buf);
            }
            Phase::PreprocessingVote {
                preprocessing_start,
            } => {
                buf.put_u8(PHASE_PREPROCESSING_VOTE);
                write_time(preprocessing_start, buf);
            }
            Phase::Complete(scheme) => {
                buf.put_u8(PHASE_COMPLETE);
                scheme.write(buf);
            }
            Phase::Abandoned => buf.put_u8(PHASE_ABANDONED),
        }
    }
}

impl<S: Suite> Read for Phase<S> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            PHASE_CRS_BOOTSTRAP => Ok(Phase::CrsBootstrap),
            PHASE_KEY_COLLECTION => Ok(Phase::KeyCollection {
                grace_period_end: read_time(buf)?,
            }),
            PHASE_PREPROCESSING_VOTE => Ok(Phase::PreprocessingVote {
                preprocessing_start: read_time(buf)?,
            }),
            PHASE_COMPLETE => Ok(Phase::Complete(Scheme::read(buf)?)),
            PHASE_ABANDONED => Ok(Phase::Abandoned),
            tag => Err(CodecError::InvalidEnum(tag)),
        }
    }
}

impl<S: Suite> EncodeSize for Phase<S> {
    fn encode_size(&self) -> usize {
        1 + match self {
            Phase::CrsBootstrap | Phase::Abandoned => 0,
            Phase::KeyCollection { grace_period_end } => time_encode_size(grace_period_end),
            Phase::PreprocessingVote {
                preprocessing_start,
            } => time_encode_size(preprocessing_start),
            Phase::Complete(scheme) => scheme.encode_size(),
        }
    }
}

/// One run of the construction protocol, targeting a specific roster
/// transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Construction<S: Suite, D: Digest> {
    /// Monotonic construction id.
    pub id: ConstructionId,
    /// The roster transition this construction targets.
    pub transition: RosterTransition<D>,
    /// Current phase, with its data.
    pub phase: Phase<S>,
}

impl<S: Suite, D: Digest> Construction<S, D> {
    /// Returns whether the construction has adopted a scheme.
    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Complete(_))
    }

    /// Returns whether the construction was abandoned.
    pub fn is_abandoned(&self) -> bool {
        matches!(self.phase, Phase::Abandoned)
    }

    /// Returns whether the construction is still working toward a scheme.
    pub fn in_progress(&self) -> bool {
        !self.is_complete() && !self.is_abandoned()
    }

    /// The adopted scheme, if the construction completed.
    pub fn scheme(&self) -> Option<&Scheme<S>> {
        match &self.phase {
            Phase::Complete(scheme) => Some(scheme),
            _ => None,
        }
    }
}

impl<S: Suite, D: Digest> Write for Construction<S, D> {
    fn write(&self, buf: &mut impl BufMut) {
        UInt(self.id).write(buf);
        self.transition.write(buf);
        self.phase.write(buf);
    }
}

impl<S: Suite, D: Digest> Read for Construction<S, D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let id = UInt::read(buf)?.into();
        let transition = RosterTransition::read(buf)?;
        let phase = Phase::read(buf)?;
        Ok(Self {
            id,
            transition,
            phase,
        })
    }
}

impl<S: Suite, D: Digest> EncodeSize for Construction<S, D> {
    fn encode_size(&self) -> usize {
        UInt(self.id).encode_size() + self.transition.encode_size() + self.phase.encode_size()
    }
}

/// A published hints key, stored by `(party id, party size)` so that later
/// constructions with the same party size can reuse it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySet<S: Suite> {
    /// The node that published the key.
    pub node: NodeId,
    /// The published hints key.
    pub key: S::HintsKey,
    /// Consensus time at which the key reached state.
    pub adopted_at: SystemTime,
}

impl<S: Suite> Write for KeySet<S> {
    fn write(&self, buf: &mut impl BufMut) {
        UInt(self.node).write(buf);
        self.key.write(buf);
        write_time(&self.adopted_at, buf);
    }
}

impl<S: Suite> Read for KeySet<S> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let node = UInt::read(buf)?.into();
        let key = S::HintsKey::read(buf)?;
        let adopted_at = read_time(buf)?;
        Ok(Self {
            node,
            key,
            adopted_at,
        })
    }
}

impl<S: Suite> EncodeSize for KeySet<S> {
    fn encode_size(&self) -> usize {
        UInt(self.node).encode_size() + self.key.encode_size() + time_encode_size(&self.adopted_at)
    }
}

const VOTE_KEYS: u8 = 0;
const VOTE_CONGRUENT: u8 = 1;

/// A node's attestation of its preprocessing output for a construction.
///
/// A node that computed the same output as an earlier voter may vote by
/// reference instead of repeating the (large) key pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Vote<S: Suite> {
    /// The preprocessing output itself.
    Keys {
        /// Aggregation key produced by preprocessing.
        aggregation: S::AggregationKey,
        /// Verification key produced by preprocessing.
        verification: S::VerificationKey,
    },
    /// Endorses the identical output already voted by the given node.
    Congruent {
        /// The earlier voter.
        node: NodeId,
    },
}

impl<S: Suite> Write for Vote<S> {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Vote::Keys {
                aggregation,
                verification,
            } => {
                buf.put_u8(VOTE_KEYS);
                aggregation.write(buf);
                verification.write(buf);
            }
            Vote::Congruent { node } => {
                buf.put_u8(VOTE_CONGRUENT);
                UInt(*node).write(buf);
            }
        }
    }
}

impl<S: Suite> Read for Vote<S> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            VOTE_KEYS => Ok(Vote::Keys {
                aggregation: S::AggregationKey::read(buf)?,
                verification: S::VerificationKey::read(buf)?,
            }),
            VOTE_CONGRUENT => Ok(Vote::Congruent {
                node: UInt::read(buf)?.into(),
            }),
            tag => Err(CodecError::InvalidEnum(tag)),
        }
    }
}

impl<S: Suite> EncodeSize for Vote<S> {
    fn encode_size(&self) -> usize {
        1 + match self {
            Vote::Keys {
                aggregation,
                verification,
            } => aggregation.encode_size() + verification.encode_size(),
            Vote::Congruent { node } => UInt(*node).encode_size(),
        }
    }
}

const RECORD_CRS_CONTRIBUTION: u8 = 0;
const RECORD_KEY_PUBLICATION: u8 = 1;
const RECORD_VOTE: u8 = 2;
const RECORD_PARTIAL: u8 = 3;

/// A node-scoped record produced by background work and broadcast to all
/// nodes.
///
/// Every node, including the originator, ingests these through the identical
/// deterministic adoption path; there is no special-casing of self-originated
/// results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record<S: Suite, D: Digest> {
    /// A CRS update with its proof of honest contribution.
    CrsContribution {
        /// The updated CRS.
        crs: S::Crs,
        /// Proof that the update mixed in fresh entropy.
        proof: S::Proof,
    },
    /// A node's hints key for a party slot.
    KeyPublication {
        /// The party id the publisher expects to hold.
        party: PartyId,
        /// The party size the key was computed for.
        parties: u32,
        /// The hints key.
        key: S::HintsKey,
    },
    /// A preprocessing vote for a construction.
    Vote {
        /// The construction voted on.
        construction: ConstructionId,
        /// The vote.
        vote: Vote<S>,
    },
    /// A partial signature over a message.
    Partial {
        /// The construction whose scheme signed.
        construction: ConstructionId,
        /// The signed message.
        message: D,
        /// The partial signature.
        partial: S::Partial,
    },
}

impl<S: Suite, D: Digest> Write for Record<S, D> {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Record::CrsContribution { crs, proof } => {
                buf.put_u8(RECORD_CRS_CONTRIBUTION);
                crs.write(buf);
                proof.write(buf);
            }
            Record::KeyPublication {
                party,
                parties,
                key,
            } => {
                buf.put_u8(RECORD_KEY_PUBLICATION);
                UInt(*party).write(buf);
                UInt(*parties).write(buf);
                key.write(buf);
            }
            Record::Vote { construction, vote } => {
                buf.put_u8(RECORD_VOTE);
                UInt(*construction).write(buf);
                vote.write(buf);
            }
            Record::Partial {
                construction,
                message,
                partial,
            } => {
                buf.put_u8(RECORD_PARTIAL);
                UInt(*construction).write(buf);
                message.write(buf);
                partial.write(buf);
            }
        }
    }
}

impl<S: Suite, D: Digest> Read for Record<S, D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            RECORD_CRS_CONTRIBUTION => Ok(Record::CrsContribution {
                crs: S::Crs::read(buf)?,
                proof: S::Proof::read(buf)?,
            }),
            RECORD_KEY_PUBLICATION => Ok(Record::KeyPublication {
                party: UInt::read(buf)?.into(),
                parties: UInt::read(buf)?.into(),
                key: S::HintsKey::read(buf)?,
            }),
            RECORD_VOTE => Ok(Record::Vote {
                construction: UInt::read(buf)?.into(),
                vote: Vote::read(buf)?,
            }),
            RECORD_PARTIAL => Ok(Record::Partial {
                construction: UInt::read(buf)?.into(),
                message: D::read(buf)?,
                partial: S::Partial::read(buf)?,
            }),
            tag => Err(CodecError::InvalidEnum(tag)),
        }
    }
}

impl<S: Suite, D: Digest> EncodeSize for Record<S, D> {
    fn encode_size(&self) -> usize {
        1 + match self {
            Record::CrsContribution { crs, proof } => crs.encode_size() + proof.encode_size(),
            Record::KeyPublication {
                party,
                parties,
                key,
            } => UInt(*party).encode_size() + UInt(*parties).encode_size() + key.encode_size(),
            Record::Vote { construction, vote } => {
                UInt(*construction).encode_size() + vote.encode_size()
            }
            Record::Partial {
                construction,
                message,
                partial,
            } => {
                UInt(*construction).encode_size() + message.encode_size() + partial.encode_size()
            }
        }
    }
}

const BLOCK_SIGNATURE_HINTS: u8 = 0;
const BLOCK_SIGNATURE_PLACEHOLDER: u8 = 1;

/// The signature delivered to the block-finalization pipeline.
///
/// When no threshold mechanism is enabled the signer degrades to a
/// deterministic one-way hash of the block hash: a placeholder signing mode,
/// not a security mechanism.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockSignature<S: Suite> {
    /// A threshold-verified hinTS aggregate signature.
    Hints(S::Signature),
    /// SHA-256 of the block hash, used when threshold signing is disabled.
    Placeholder(commonware_cryptography::sha256::Digest),
}

impl<S: Suite> Write for BlockSignature<S> {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            BlockSignature::Hints(signature) => {
                buf.put_u8(BLOCK_SIGNATURE_HINTS);
                signature.write(buf);
            }
            BlockSignature::Placeholder(digest) => {
                buf.put_u8(BLOCK_SIGNATURE_PLACEHOLDER);
                digest.write(buf);
            }
        }
    }
}

impl<S: Suite> Read for BlockSignature<S> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            BLOCK_SIGNATURE_HINTS => Ok(BlockSignature::Hints(S::Signature::read(buf)?)),
            BLOCK_SIGNATURE_PLACEHOLDER => Ok(BlockSignature::Placeholder(
                commonware_cryptography::sha256::Digest::read(buf)?,
            )),
            tag => Err(CodecError::InvalidEnum(tag)),
        }
    }
}

impl<S: Suite> EncodeSize for BlockSignature<S> {
    fn encode_size(&self) -> usize {
        1 + match self {
            BlockSignature::Hints(signature) => signature.encode_size(),
            BlockSignature::Placeholder(digest) => digest.encode_size(),
        }
    }
}

/// The replicated hinTS state.
///
/// Mutated only on the consensus-processing path (inside reconciliation and
/// record ingestion), so every node holding the same state and feeding it the
/// same inputs derives the same successor state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct State<S: Suite, D: Digest> {
    /// The CRS ceremony state, absent until first bootstrapped.
    pub crs: Option<CrsState<S>>,
    /// All constructions ever started, by id. Superseded constructions are
    /// abandoned, never deleted.
    pub constructions: BTreeMap<ConstructionId, Construction<S, D>>,
    /// Published hints keys by `(party id, party size)`.
    pub keys: BTreeMap<(PartyId, u32), KeySet<S>>,
    /// Preprocessing votes by `(construction id, voter node id)`.
    pub votes: BTreeMap<(ConstructionId, NodeId), Vote<S>>,
    /// The complete construction currently used for signing, if any.
    pub signing: Option<ConstructionId>,
    /// The id the next construction will be assigned.
    pub next_id: ConstructionId,
}

impl<S: Suite, D: Digest> Default for State<S, D> {
    fn default() -> Self {
        Self {
            crs: None,
            constructions: BTreeMap::new(),
            keys: BTreeMap::new(),
            votes: BTreeMap::new(),
            signing: None,
            next_id: 0,
        }
    }
}

impl<S: Suite, D: Digest> State<S, D> {
    /// Returns the live (not abandoned) construction targeting the given
    /// transition, if any. A transition whose construction was abandoned
    /// gets a fresh one if it becomes active again.
    pub fn construction_for(&self, transition: &RosterTransition<D>) -> Option<&Construction<S, D>> {
        self.constructions
            .values()
            .find(|construction| {
                !construction.is_abandoned()
                    && construction.transition.source == transition.source
                    && construction.transition.target == transition.target
            })
    }

    /// Returns the single in-progress construction, if any.
    pub fn in_progress(&self) -> Option<&Construction<S, D>> {
        self.constructions
            .values()
            .find(|construction| construction.in_progress())
    }

    /// Returns the construction currently used for signing.
    pub fn signing_construction(&self) -> Option<&Construction<S, D>> {
        self.signing
            .and_then(|id| self.constructions.get(&id))
    }

    /// All votes recorded for the given construction, by voter.
    pub fn votes_for(&self, construction: ConstructionId) -> BTreeMap<NodeId, Vote<S>> {
        self.votes
            .range((construction, NodeId::MIN)..=(construction, NodeId::MAX))
            .map(|((_, node), vote)| (*node, vote.clone()))
            .collect()
    }

    /// All published key sets for the given party size, by party id.
    pub fn keys_for(&self, parties: u32) -> BTreeMap<PartyId, KeySet<S>> {
        self.keys
            .iter()
            .filter(|((_, size), _)| *size == parties)
            .map(|((party, _), set)| (*party, set.clone()))
            .collect()
    }
}

impl<S: Suite, D: Digest> Write for State<S, D> {
    fn write(&self, buf: &mut impl BufMut) {
        match &self.crs {
            Some(crs) => {
                buf.put_u8(1);
                crs.write(buf);
            }
            None => buf.put_u8(0),
        }
        UInt(self.constructions.len() as u64).write(buf);
        for construction in self.constructions.values() {
            construction.write(buf);
        }
        UInt(self.keys.len() as u64).write(buf);
        for ((party, parties), set) in &self.keys {
            UInt(*party).write(buf);
            UInt(*parties).write(buf);
            set.write(buf);
        }
        UInt(self.votes.len() as u64).write(buf);
        for ((construction, node), vote) in &self.votes {
            UInt(*construction).write(buf);
            UInt(*node).write(buf);
            vote.write(buf);
        }
        match self.signing {
            Some(id) => {
                buf.put_u8(1);
                UInt(id).write(buf);
            }
            None => buf.put_u8(0),
        }
        UInt(self.next_id).write(buf);
    }
}

impl<S: Suite, D: Digest> Read for State<S, D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let crs = match u8::read(buf)? {
            0 => None,
            1 => Some(CrsState::read(buf)?),
            tag => return Err(CodecError::InvalidEnum(tag)),
        };
        let len: u64 = UInt::read(buf)?.into();
        let mut constructions = BTreeMap::new();
        for _ in 0..len {
            let construction = Construction::<S, D>::read(buf)?;
            constructions.insert(construction.id, construction);
        }
        let len: u64 = UInt::read(buf)?.into();
        let mut keys = BTreeMap::new();
        for _ in 0..len {
            let party: u32 = UInt::read(buf)?.into();
            let parties: u32 = UInt::read(buf)?.into();
            keys.insert((party, parties), KeySet::<S>::read(buf)?);
        }
        let len: u64 = UInt::read(buf)?.into();
        let mut votes = BTreeMap::new();
        for _ in 0..len {
            let construction: u64 = UInt::read(buf)?.into();
            let node: u64 = UInt::read(buf)?.into();
            votes.insert((construction, node), Vote::<S>::read(buf)?);
        }
        let signing = match u8::read(buf)? {
            0 => None,
            1 => Some(UInt::read(buf)?.into()),
            tag => return Err(CodecError::InvalidEnum(tag)),
        };
        let next_id = UInt::read(buf)?.into();
        Ok(Self {
            crs,
            constructions,
            keys,
            votes,
            signing,
            next_id,
        })
    }
}

impl<S: Suite, D: Digest> EncodeSize for State<S, D> {
    fn encode_size(&self) -> usize {
        let mut size = 1 + self.crs.as_ref().map_or(0, |crs| crs.encode_size());
        size += UInt(self.constructions.len() as u64).encode_size();
        for construction in self.constructions.values() {
            size += construction.encode_size();
        }
        size += UInt(self.keys.len() as u64).encode_size();
        for ((party, parties), set) in &self.keys {
            size += UInt(*party).encode_size() + UInt(*parties).encode_size() + set.encode_size();
        }
        size += UInt(self.votes.len() as u64).encode_size();
        for ((construction, node), vote) in &self.votes {
            size +=
                UInt(*construction).encode_size() + UInt(*node).encode_size() + vote.encode_size();
        }
        size += 1 + self.signing.map_or(0, |id| UInt(id).encode_size());
        size + UInt(self.next_id).encode_size()
    }
}
