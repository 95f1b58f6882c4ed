//! Orchestrate succinct threshold signatures over finalized blocks.
//!
//! This crate implements the deterministic multi-party construction protocol
//! for the hinTS threshold-signature scheme: consensus nodes collectively
//! derive a common reference string, publish and validate per-party keys,
//! agree on a preprocessing output by weighted vote, and then sign each
//! finalized block hash with an aggregate signature no single node could
//! produce alone. The pairing arithmetic itself is abstracted behind
//! [Suite]; this crate owns the hard part, which is that every honest node
//! must independently derive the same sequence of decisions using only
//! replicated state, consensus time, and gossiped results.
//!
//! # Architecture
//!
//! The authoritative protocol state ([types::State]) is replicated and only
//! mutated on the consensus-processing path. Each roster transition gets at
//! most one in-progress construction, advanced by a
//! [coordinator::Coordinator] that [lifecycle::Manager] creates on demand
//! and abandons the moment a different transition becomes active. The
//! in-memory coordinator is a cache: it can be rebuilt from replicated state
//! at any time, and losing it costs only re-validation of replayed material.
//!
//! Cryptographic work never blocks consensus processing. Advancing a
//! construction returns [coordinator::Dispatch] values describing the work
//! this node should perform (contribute to the CRS, publish a hints key, run
//! preprocessing); the host executes them on background tasks, broadcasts
//! each result as a [types::Record], and feeds incoming records (its own
//! included) back through [lifecycle::Manager::ingest]. Because every node
//! applies the same records in the same order to the same state, all nodes
//! agree on which CRS is canonical, which keys are valid, and which
//! aggregation/verification key pair is adopted, without any coordinator
//! process.
//!
//! Once a construction completes, [signer::Signer] collects partial
//! signatures for each block hash and resolves the caller's future as soon
//! as verified weight strictly exceeds the configured threshold.
//!
//! # Determinism
//!
//! Phase transitions are totally ordered by the consensus time passed into
//! reconciliation, so nodes whose background work finishes at different
//! wall-clock times still derive identical transition histories. Votes on
//! non-deterministic inputs (which key subset a node validated) are settled
//! by the strong-minority rule: the first output whose voters carry more
//! than one third of roster weight wins.

pub mod aggregator;
mod config;
pub use config::Config;
pub mod coordinator;
pub mod crs;
pub mod lifecycle;
mod metrics;
pub mod preprocessing;
pub mod registry;
pub mod signer;
pub mod store;
mod suite;
pub use suite::{Material, Suite};
pub mod types;
pub use types::{exceeds_fraction, exceeds_strong_minority, exceeds_two_thirds};

#[cfg(test)]
pub mod mocks;

use thiserror::Error as ThisError;

use types::{ConstructionId, NodeId, PartyId};

/// Errors that can occur while advancing a construction or signing.
///
/// Per-contribution failures (invalid proofs, keys, votes, or partial
/// signatures) are absorbed at the component boundary: the offending input
/// is excluded and the protocol continues without it.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The CRS ceremony already froze; contributions are no longer accepted.
    #[error("CRS ceremony already complete")]
    CeremonyComplete,
    /// The CRS ceremony has not frozen a CRS yet.
    #[error("CRS ceremony not complete")]
    CeremonyIncomplete,
    /// A CRS contribution arrived from a node outside the source roster.
    #[error("node {0} is not a scheduled contributor")]
    UnknownContributor(NodeId),
    /// A CRS contribution arrived outside the contributor's window.
    #[error("node {0} contributed out of turn")]
    OutOfTurn(NodeId),
    /// A CRS contribution's proof did not verify.
    #[error("invalid CRS contribution from node {0}")]
    InvalidContribution(NodeId),
    /// A record arrived from a node outside the relevant roster.
    #[error("node {0} is not in the roster")]
    UnknownNode(NodeId),
    /// A key publication claimed a party id other than the assigned one.
    #[error("node {node} published for party {actual}, expected {expected}")]
    UnexpectedParty {
        /// The publishing node.
        node: NodeId,
        /// The party id the assignment scheme expects.
        expected: PartyId,
        /// The party id the publication claimed.
        actual: PartyId,
    },
    /// A conflicting key was already accepted for the party.
    #[error("party {0} already registered a different key")]
    KeyAlreadyRegistered(PartyId),
    /// A hints key failed validation against the CRS.
    #[error("invalid hints key for party {0}")]
    InvalidKey(PartyId),
    /// A key publication was computed for a different party size.
    #[error("party count mismatch: expected {expected}, got {actual}")]
    PartyCountMismatch {
        /// The construction's party size.
        expected: u32,
        /// The publication's party size.
        actual: u32,
    },
    /// A node voted more than once for a construction.
    #[error("duplicate vote from node {0}")]
    DuplicateVote(NodeId),
    /// A congruent vote referenced a node that has not voted.
    #[error("congruent vote references unknown voter {0}")]
    UnknownCongruentVote(NodeId),
    /// A record targeted a construction other than the live one.
    #[error("construction mismatch: expected {expected}, got {actual}")]
    ConstructionMismatch {
        /// The live construction.
        expected: ConstructionId,
        /// The construction named by the record.
        actual: ConstructionId,
    },
    /// No construction is in progress to route the record to.
    #[error("no construction in progress")]
    NoConstruction,
    /// The record kind is not handled by this component.
    #[error("record not routable here")]
    UnexpectedRecord,
    /// A handoff would override the trust chain without `force_handoffs`.
    #[error("handoff would break the trust chain")]
    BrokenTrustChain,
    /// Signing was attempted before a scheme was adopted.
    #[error("threshold signer not ready")]
    NotReady,
    /// A partial signature arrived from a node with no party in the scheme.
    #[error("node {0} is not a signer in the active scheme")]
    UnknownSigner(NodeId),
    /// A partial signature failed verification.
    #[error("invalid partial signature from node {0}")]
    InvalidPartial(NodeId),
    /// An artifact already exists for the sequence number.
    #[error("artifact already exists for sequence {0}")]
    ArtifactExists(u64),
    /// The underlying runtime failed.
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
}

/// Returns the party size for a roster of `num_signers` nodes: the smallest
/// power of two `M` such that `num_signers + 1 < M`.
pub fn party_size(num_signers: u32) -> u32 {
    (num_signers + 2).next_power_of_two()
}
