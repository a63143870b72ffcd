//! Shared types for the distribution engine
//!
//! Cycle identity, holder snapshots, allocation rows and per-stage results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of one fixed-width window: `floor(now / width)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CycleId(pub u64);

impl CycleId {
    /// Idempotency token for a stage of this cycle, e.g. `claim:4812`
    pub fn key(&self, stage: &str) -> String {
        format!("{}:{}", stage, self.0)
    }
}

impl std::fmt::Display for CycleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named stage of a distribution cycle, in firing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Claim,
    Swap,
    Distribute,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Claim, Stage::Swap, Stage::Distribute];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Claim => "claim",
            Stage::Swap => "swap",
            Stage::Distribute => "airdrop",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One holder's eligibility weight, captured fresh each distribution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderSnapshot {
    pub wallet: String,
    pub weight: u64,
}

impl HolderSnapshot {
    pub fn new(wallet: impl Into<String>, weight: u64) -> Self {
        Self {
            wallet: wallet.into(),
            weight,
        }
    }
}

/// Amount owed to one wallet, in reward-token base units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRow {
    pub wallet: String,
    pub amount: u64,
}

impl AllocationRow {
    pub fn new(wallet: impl Into<String>, amount: u64) -> Self {
        Self {
            wallet: wallet.into(),
            amount,
        }
    }
}

/// Result of the fee-claim stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResult {
    pub at: DateTime<Utc>,
    /// Lamports moved into the distributor wallet
    pub amount_moved: u64,
    pub reference_id: Option<String>,
}

/// Result of the swap stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapResult {
    pub at: DateTime<Utc>,
    /// Lamports spent
    pub amount_in: u64,
    /// Reward-token base units received
    pub amount_moved: u64,
    pub reference_id: Option<String>,
}

/// Result of the distribution stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirdropResult {
    pub at: DateTime<Utc>,
    /// Reward-token base units confirmed on the ledger
    pub amount_moved: u64,
    pub recipients: usize,
    pub dropped: usize,
    pub failed: usize,
    /// First confirmed signature, for display
    pub reference_id: Option<String>,
}

/// A swap whose transaction was signed and persisted before sending.
///
/// After a restart in the same cycle the signature is looked up instead of
/// swapping again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapIntent {
    pub cycle: CycleId,
    pub signature: String,
    pub last_valid_block_height: u64,
    pub lamports_in: u64,
    /// Reward balance before sending, to measure what the swap bought
    pub balance_before: u64,
}
