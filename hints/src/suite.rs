//! Abstraction over the hinTS pairing arithmetic.
//!
//! The construction protocol never inspects cryptographic material; it only
//! moves it between parties, validates it, and persists it. [Suite] captures
//! the operations the protocol needs, leaving the curve and its constant-time
//! arithmetic to the implementation. Every associated type must be encodable
//! because all material is either gossiped to other nodes or persisted in
//! replicated state.

use commonware_codec::{EncodeSize, Read, Write};
use rand::{CryptoRng, Rng};
use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::types::{PartyId, Weight};

/// Material that can be gossiped and persisted.
///
/// Blanket-implemented for any type with the required bounds; implementations
/// of [Suite] never need to implement it directly.
pub trait Material:
    Clone + Debug + PartialEq + Eq + Send + Sync + Write + EncodeSize + Read<Cfg = ()> + 'static
{
}

impl<T> Material for T where
    T: Clone + Debug + PartialEq + Eq + Send + Sync + Write + EncodeSize + Read<Cfg = ()> + 'static
{
}

/// The cryptographic operations required by the hinTS construction protocol.
///
/// The relationship between the hinTS algorithms and these operations:
/// - **CRS creation** (`Setup`): [Suite::new_crs], [Suite::update_crs], and
///   [Suite::verify_crs_update].
/// - **Key generation** (`KGen`): [Suite::new_private_key].
/// - **Hint generation** (`HintGen`): [Suite::compute_hints].
/// - **Preprocessing** (`Preprocess`): [Suite::preprocess] over the validated
///   hints keys and party weights.
/// - **Partial signatures** (`Sign`/`PartialVerify`): [Suite::partial_sign]
///   and [Suite::verify_partial].
/// - **Aggregation** (`SignAggr`/`Verify`): [Suite::aggregate] and
///   [Suite::verify_aggregate].
///
/// All operations must be deterministic functions of their inputs (entropy is
/// always passed in explicitly), so that any two nodes running the same
/// operation over the same inputs obtain identical outputs.
pub trait Suite: Clone + Debug + PartialEq + Eq + Send + Sync + 'static {
    /// Common reference string shared by all parties.
    type Crs: Material;
    /// Proof that a CRS update honestly mixed in fresh entropy.
    type Proof: Material;
    /// A party's BLS private key.
    type PrivateKey: Material;
    /// A party's public key with hints, sized for a specific party count.
    type HintsKey: Material + Ord;
    /// Linear-size key used to combine partial signatures.
    type AggregationKey: Material + Ord;
    /// Succinct key used to verify aggregate signatures.
    type VerificationKey: Material + Ord;
    /// A single party's signature over a message.
    type Partial: Material;
    /// A threshold-verified aggregate signature.
    type Signature: Material;

    /// Returns the initial CRS for the given number of parties.
    ///
    /// Must be deterministic in `parties`: every node derives the identical
    /// genesis CRS before any contributions are mixed in.
    fn new_crs(parties: u32) -> Self::Crs;

    /// Mixes 256 bits of fresh entropy into the CRS, returning the updated
    /// CRS and a proof of honest contribution.
    fn update_crs(crs: &Self::Crs, entropy: [u8; 32]) -> (Self::Crs, Self::Proof);

    /// Verifies a proof that `new` was derived from `old` by an honest
    /// contribution.
    fn verify_crs_update(old: &Self::Crs, new: &Self::Crs, proof: &Self::Proof) -> bool;

    /// Generates a new BLS private key.
    fn new_private_key<R: Rng + CryptoRng>(rng: &mut R) -> Self::PrivateKey;

    /// Computes the hints key for the given party under the final CRS.
    fn compute_hints(
        crs: &Self::Crs,
        key: &Self::PrivateKey,
        party: PartyId,
        parties: u32,
    ) -> Self::HintsKey;

    /// Validates a hints key for the given party under the final CRS.
    fn validate_hints_key(
        crs: &Self::Crs,
        hints: &Self::HintsKey,
        party: PartyId,
        parties: u32,
    ) -> bool;

    /// Runs hinTS preprocessing over the validated hints keys and party
    /// weights. Both maps must have the same key set.
    ///
    /// The output depends on the exact key set given, so two nodes that
    /// validated different subsets will produce different outputs; agreement
    /// on one output is reached by the preprocessing vote.
    fn preprocess(
        crs: &Self::Crs,
        keys: &BTreeMap<PartyId, Self::HintsKey>,
        weights: &BTreeMap<PartyId, Weight>,
        parties: u32,
    ) -> (Self::AggregationKey, Self::VerificationKey);

    /// Signs a message with a BLS private key.
    fn partial_sign(message: &[u8], key: &Self::PrivateKey) -> Self::Partial;

    /// Checks a partial signature against the signer's public material in the
    /// aggregation key.
    fn verify_partial(
        crs: &Self::Crs,
        partial: &Self::Partial,
        message: &[u8],
        aggregation: &Self::AggregationKey,
        party: PartyId,
    ) -> bool;

    /// Aggregates verified partial signatures into a threshold signature.
    fn aggregate(
        crs: &Self::Crs,
        aggregation: &Self::AggregationKey,
        verification: &Self::VerificationKey,
        partials: &BTreeMap<PartyId, Self::Partial>,
    ) -> Self::Signature;

    /// Checks an aggregate signature on a message, where the check only
    /// passes if the signature carries weight strictly exceeding the given
    /// fraction of the total weight stipulated in the verification key.
    fn verify_aggregate(
        signature: &Self::Signature,
        message: &[u8],
        verification: &Self::VerificationKey,
        threshold_numerator: u64,
        threshold_denominator: u64,
    ) -> bool;
}
