//! Test doubles for the construction protocol.
//!
//! [MockSuite] is a hash-backed stand-in for the pairing arithmetic whose
//! verification relations really hold: proofs only verify against the CRS
//! they extended, hints keys only validate for the party and size they were
//! computed for, partial signatures only verify for the message and key they
//! signed, and aggregate verification enforces the weight threshold. It is
//! deterministic, so every node in a test derives identical outputs from
//! identical inputs.

use bytes::{Buf, BufMut};
use commonware_codec::{varint::UInt, Encode, EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::{sha256, Hasher, Sha256};
use rand::{rngs::StdRng, CryptoRng, Rng, SeedableRng};
use std::collections::BTreeMap;

use crate::suite::Suite;
use crate::types::{NodeId, PartyId, RosterTransition, Weight};
use crate::{exceeds_fraction, party_size};

/// An opaque 32-byte value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Opaque(pub [u8; 32]);

impl Write for Opaque {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }
}

impl Read for Opaque {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        if buf.remaining() < 32 {
            return Err(CodecError::EndOfBuffer);
        }
        let mut bytes = [0u8; 32];
        buf.copy_to_slice(&mut bytes);
        Ok(Self(bytes))
    }
}

impl EncodeSize for Opaque {
    fn encode_size(&self) -> usize {
        32
    }
}

fn digest(parts: &[&[u8]]) -> Opaque {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(hasher.finalize().as_ref());
    Opaque(bytes)
}

/// A hints key: the holder's public key plus a tag binding it to the CRS,
/// party id, and party size it was computed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HintsKey {
    /// Public key of the holder.
    pub public: Opaque,
    /// Binding tag checked by validation.
    pub tag: Opaque,
}

impl Write for HintsKey {
    fn write(&self, buf: &mut impl BufMut) {
        self.public.write(buf);
        self.tag.write(buf);
    }
}

impl Read for HintsKey {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            public: Opaque::read(buf)?,
            tag: Opaque::read(buf)?,
        })
    }
}

impl EncodeSize for HintsKey {
    fn encode_size(&self) -> usize {
        self.public.encode_size() + self.tag.encode_size()
    }
}

/// The linear-size aggregation key: per-party public material and weights,
/// as real hinTS aggregation keys carry.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct AggregationKey {
    /// Public key and weight by party id.
    pub entries: BTreeMap<PartyId, (Opaque, Weight)>,
    /// The party size preprocessing ran for.
    pub parties: u32,
}

impl Write for AggregationKey {
    fn write(&self, buf: &mut impl BufMut) {
        UInt(self.entries.len() as u64).write(buf);
        for (party, (public, weight)) in &self.entries {
            UInt(*party).write(buf);
            public.write(buf);
            UInt(*weight).write(buf);
        }
        UInt(self.parties).write(buf);
    }
}

impl Read for AggregationKey {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let len: u64 = UInt::read(buf)?.into();
        let mut entries = BTreeMap::new();
        for _ in 0..len {
            let party: u32 = UInt::read(buf)?.into();
            let public = Opaque::read(buf)?;
            let weight: u64 = UInt::read(buf)?.into();
            entries.insert(party, (public, weight));
        }
        let parties = UInt::read(buf)?.into();
        Ok(Self { entries, parties })
    }
}

impl EncodeSize for AggregationKey {
    fn encode_size(&self) -> usize {
        let mut size = UInt(self.entries.len() as u64).encode_size();
        for (party, (public, weight)) in &self.entries {
            size += UInt(*party).encode_size() + public.encode_size() + UInt(*weight).encode_size();
        }
        size + UInt(self.parties).encode_size()
    }
}

/// The succinct verification key: a commitment to the aggregation key and
/// the total weight it covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VerificationKey {
    /// Commitment to the aggregation key.
    pub commitment: Opaque,
    /// Total weight stipulated by the key.
    pub total: Weight,
}

impl Write for VerificationKey {
    fn write(&self, buf: &mut impl BufMut) {
        self.commitment.write(buf);
        UInt(self.total).write(buf);
    }
}

impl Read for VerificationKey {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            commitment: Opaque::read(buf)?,
            total: UInt::read(buf)?.into(),
        })
    }
}

impl EncodeSize for VerificationKey {
    fn encode_size(&self) -> usize {
        self.commitment.encode_size() + UInt(self.total).encode_size()
    }
}

/// A partial signature: the signature value and a commitment to the signed
/// message so aggregation can bind the two.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Partial {
    /// Signature over the message.
    pub signature: Opaque,
    /// Commitment to the message.
    pub commitment: Opaque,
}

impl Write for Partial {
    fn write(&self, buf: &mut impl BufMut) {
        self.signature.write(buf);
        self.commitment.write(buf);
    }
}

impl Read for Partial {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            signature: Opaque::read(buf)?,
            commitment: Opaque::read(buf)?,
        })
    }
}

impl EncodeSize for Partial {
    fn encode_size(&self) -> usize {
        self.signature.encode_size() + self.commitment.encode_size()
    }
}

/// An aggregate signature carrying the weight that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Signature {
    /// Aggregate over the message under the verification key.
    pub signature: Opaque,
    /// Combined weight of the contributing signers.
    pub weight: Weight,
}

impl Write for Signature {
    fn write(&self, buf: &mut impl BufMut) {
        self.signature.write(buf);
        UInt(self.weight).write(buf);
    }
}

impl Read for Signature {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            signature: Opaque::read(buf)?,
            weight: UInt::read(buf)?.into(),
        })
    }
}

impl EncodeSize for Signature {
    fn encode_size(&self) -> usize {
        self.signature.encode_size() + UInt(self.weight).encode_size()
    }
}

/// Deterministic hash-backed [Suite] implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MockSuite;

impl MockSuite {
    /// A private key derived from a seed.
    pub fn private_key(seed: u64) -> Opaque {
        let mut rng = StdRng::seed_from_u64(seed);
        <Self as Suite>::new_private_key(&mut rng)
    }

    /// The public key for a private key.
    pub fn public_key(key: &Opaque) -> Opaque {
        digest(&[b"public", &key.0])
    }

    /// Convenience alias for [Suite::new_crs].
    pub fn genesis_crs(parties: u32) -> Opaque {
        <Self as Suite>::new_crs(parties)
    }

    /// Convenience alias for [Suite::compute_hints].
    pub fn hints_for(crs: &Opaque, key: &Opaque, party: PartyId, parties: u32) -> HintsKey {
        <Self as Suite>::compute_hints(crs, key, party, parties)
    }
}

impl Suite for MockSuite {
    type Crs = Opaque;
    type Proof = Opaque;
    type PrivateKey = Opaque;
    type HintsKey = HintsKey;
    type AggregationKey = AggregationKey;
    type VerificationKey = VerificationKey;
    type Partial = Partial;
    type Signature = Signature;

    fn new_crs(parties: u32) -> Opaque {
        digest(&[b"crs", &parties.to_be_bytes()])
    }

    fn update_crs(crs: &Opaque, entropy: [u8; 32]) -> (Opaque, Opaque) {
        let updated = digest(&[b"crs-update", &crs.0, &entropy]);
        let proof = digest(&[b"crs-proof", &crs.0, &updated.0]);
        (updated, proof)
    }

    fn verify_crs_update(old: &Opaque, new: &Opaque, proof: &Opaque) -> bool {
        *proof == digest(&[b"crs-proof", &old.0, &new.0])
    }

    fn new_private_key<R: Rng + CryptoRng>(rng: &mut R) -> Opaque {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Opaque(bytes)
    }

    fn compute_hints(crs: &Opaque, key: &Opaque, party: PartyId, parties: u32) -> HintsKey {
        let public = Self::public_key(key);
        let tag = digest(&[
            b"hints",
            &crs.0,
            &public.0,
            &party.to_be_bytes(),
            &parties.to_be_bytes(),
        ]);
        HintsKey { public, tag }
    }

    fn validate_hints_key(crs: &Opaque, hints: &HintsKey, party: PartyId, parties: u32) -> bool {
        hints.tag
            == digest(&[
                b"hints",
                &crs.0,
                &hints.public.0,
                &party.to_be_bytes(),
                &parties.to_be_bytes(),
            ])
    }

    fn preprocess(
        crs: &Opaque,
        keys: &BTreeMap<PartyId, HintsKey>,
        weights: &BTreeMap<PartyId, Weight>,
        parties: u32,
    ) -> (AggregationKey, VerificationKey) {
        let entries = keys
            .iter()
            .map(|(party, key)| {
                let weight = weights.get(party).copied().unwrap_or(0);
                (*party, (key.public, weight))
            })
            .collect();
        let aggregation = AggregationKey { entries, parties };
        let commitment = digest(&[b"verify", &crs.0, aggregation.encode().as_ref()]);
        let total = weights.values().sum();
        (aggregation, VerificationKey { commitment, total })
    }

    fn partial_sign(message: &[u8], key: &Opaque) -> Partial {
        let public = Self::public_key(key);
        Partial {
            signature: digest(&[b"partial", &public.0, message]),
            commitment: digest(&[b"message", message]),
        }
    }

    fn verify_partial(
        _crs: &Opaque,
        partial: &Partial,
        message: &[u8],
        aggregation: &AggregationKey,
        party: PartyId,
    ) -> bool {
        let Some((public, _)) = aggregation.entries.get(&party) else {
            return false;
        };
        partial.signature == digest(&[b"partial", &public.0, message])
            && partial.commitment == digest(&[b"message", message])
    }

    fn aggregate(
        _crs: &Opaque,
        aggregation: &AggregationKey,
        verification: &VerificationKey,
        partials: &BTreeMap<PartyId, Partial>,
    ) -> Signature {
        let commitment = partials
            .values()
            .next()
            .map(|partial| partial.commitment)
            .unwrap_or(Opaque([0u8; 32]));
        let weight = partials
            .keys()
            .filter_map(|party| aggregation.entries.get(party))
            .map(|(_, weight)| weight)
            .sum();
        Signature {
            signature: digest(&[b"aggregate", &verification.commitment.0, &commitment.0]),
            weight,
        }
    }

    fn verify_aggregate(
        signature: &Signature,
        message: &[u8],
        verification: &VerificationKey,
        threshold_numerator: u64,
        threshold_denominator: u64,
    ) -> bool {
        let commitment = digest(&[b"message", message]);
        signature.signature
            == digest(&[b"aggregate", &verification.commitment.0, &commitment.0])
            && exceeds_fraction(
                signature.weight,
                verification.total,
                threshold_numerator,
                threshold_denominator,
            )
    }
}

/// Build a roster transition from `(node, weight)` lists, hashing each
/// roster to derive its identifier.
pub fn transition(
    source: &[(NodeId, Weight)],
    target: &[(NodeId, Weight)],
) -> RosterTransition<sha256::Digest> {
    RosterTransition {
        source: roster_hash(source),
        target: roster_hash(target),
        source_weights: source.iter().copied().collect(),
        target_weights: target.iter().copied().collect(),
    }
}

fn roster_hash(roster: &[(NodeId, Weight)]) -> sha256::Digest {
    let mut hasher = Sha256::new();
    for (node, weight) in roster {
        hasher.update(&node.to_be_bytes());
        hasher.update(&weight.to_be_bytes());
    }
    hasher.finalize()
}

/// A ready-to-sign scheme over `n` unit-weight nodes (ids `1..=n`, party ids
/// matching node ids), as produced by a completed construction.
pub struct SigningFixture {
    /// The frozen CRS.
    pub crs: Opaque,
    /// The aggregation key over all `n` parties.
    pub aggregation: AggregationKey,
    /// The matching verification key.
    pub verification: VerificationKey,
    /// Node-to-party assignments.
    pub parties: BTreeMap<NodeId, PartyId>,
    /// Unit weights by node.
    pub weights: BTreeMap<NodeId, Weight>,
    /// Each node's private key.
    pub keys: BTreeMap<NodeId, Opaque>,
}

/// Build a [SigningFixture] for `n` unit-weight nodes.
pub fn signing_fixture(n: u32) -> SigningFixture {
    let size = party_size(n);
    let crs = MockSuite::genesis_crs(size);
    let mut parties = BTreeMap::new();
    let mut weights = BTreeMap::new();
    let mut keys = BTreeMap::new();
    let mut hints = BTreeMap::new();
    let mut party_weights = BTreeMap::new();
    for node in 1..=n as NodeId {
        let party = node as PartyId;
        let key = MockSuite::private_key(node);
        hints.insert(party, MockSuite::hints_for(&crs, &key, party, size));
        party_weights.insert(party, 1);
        parties.insert(node, party);
        weights.insert(node, 1);
        keys.insert(node, key);
    }
    let (aggregation, verification) = MockSuite::preprocess(&crs, &hints, &party_weights, size);
    SigningFixture {
        crs,
        aggregation,
        verification,
        parties,
        weights,
        keys,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crs_update_verifies() {
        let crs = MockSuite::genesis_crs(8);
        let (updated, proof) = MockSuite::update_crs(&crs, [7u8; 32]);
        assert!(MockSuite::verify_crs_update(&crs, &updated, &proof));
        // A proof does not verify against a different base CRS.
        assert!(!MockSuite::verify_crs_update(&updated, &updated, &proof));
    }

    #[test]
    fn test_hints_key_binds_party_and_size() {
        let crs = MockSuite::genesis_crs(8);
        let key = MockSuite::private_key(1);
        let hints = MockSuite::hints_for(&crs, &key, 3, 8);
        assert!(MockSuite::validate_hints_key(&crs, &hints, 3, 8));
        assert!(!MockSuite::validate_hints_key(&crs, &hints, 4, 8));
        assert!(!MockSuite::validate_hints_key(&crs, &hints, 3, 16));
    }

    #[test]
    fn test_preprocessing_is_deterministic() {
        let fixture = signing_fixture(4);
        let other = signing_fixture(4);
        assert_eq!(fixture.aggregation, other.aggregation);
        assert_eq!(fixture.verification, other.verification);
    }
}
