//! Configuration for the construction protocol.

use std::time::Duration;

/// Configuration for the hinTS construction protocol and signer.
///
/// All durations are measured in consensus time, so every node applies them
/// identically regardless of wall-clock drift.
#[derive(Clone, Debug)]
pub struct Config {
    /// How long parties may publish hints keys for the bootstrap
    /// construction before key collection closes.
    pub bootstrap_key_grace_period: Duration,

    /// How long parties may publish hints keys for a roster-transition
    /// construction before key collection closes.
    pub transition_key_grace_period: Duration,

    /// How long parties may publish proof keys for the bootstrap
    /// construction of the companion history mechanism.
    pub bootstrap_proof_key_grace_period: Duration,

    /// How long parties may publish proof keys for a roster-transition
    /// construction of the companion history mechanism.
    pub transition_proof_key_grace_period: Duration,

    /// How long each node's CRS contribution window stays open.
    pub crs_update_contribution_time: Duration,

    /// How long the ceremony waits after the last contribution window before
    /// adopting (or restarting) the CRS.
    pub crs_finalization_delay: Duration,

    /// Number of parties the genesis CRS is sized for. Zero sizes the CRS
    /// from the bootstrap roster's node count instead.
    pub initial_crs_parties: u32,

    /// Whether hinTS signing is enabled.
    pub hints_enabled: bool,

    /// Whether the companion history-proof mechanism gates readiness.
    pub history_enabled: bool,

    /// Whether a roster handoff may replace the signing construction even
    /// though the superseded construction is still in use.
    pub force_handoffs: bool,

    /// Fraction of total roster weight (numerator, denominator) that
    /// verified partial signatures must strictly exceed before they are
    /// aggregated.
    pub signing_threshold: (u64, u64),

    /// Storage partition for node-local cryptographic artifacts.
    pub store_partition: String,
}

impl Config {
    /// A configuration suitable for tests: short windows, hinTS enabled,
    /// signing at one half.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            bootstrap_key_grace_period: Duration::from_secs(60),
            transition_key_grace_period: Duration::from_secs(30),
            bootstrap_proof_key_grace_period: Duration::from_secs(60),
            transition_proof_key_grace_period: Duration::from_secs(30),
            crs_update_contribution_time: Duration::from_secs(10),
            crs_finalization_delay: Duration::from_secs(5),
            initial_crs_parties: 0,
            hints_enabled: true,
            history_enabled: false,
            force_handoffs: false,
            signing_threshold: (1, 2),
            store_partition: "hints".to_string(),
        }
    }
}
