//! Proportional allocation with exact conservation
//!
//! Largest-remainder apportionment over integer weights:
//!
//! 1. `base_i = floor(P * w_i / T)`, `rem_i = (P * w_i) mod T` (u128 math)
//! 2. the shortfall `P - Σ base_i` (always `< n`) goes one unit at a time to
//!    the largest remainders, ties broken by ascending wallet
//! 3. zero rows are dropped
//!
//! The output sums to `P` exactly and is identical for identical inputs
//! regardless of input order. Policy filtering (equal split, minimum weight,
//! whale cap, exclusions) happens before the apportionment.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::types::{AllocationRow, HolderSnapshot};

/// How weights translate into shares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationMode {
    /// Share proportional to holding size
    #[default]
    Proportional,
    /// Every eligible holder gets the same share
    Equal,
}

/// Eligibility and weighting rules applied before apportionment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationPolicy {
    #[serde(default)]
    pub mode: AllocationMode,
    /// Holders with less than this weight are ineligible
    #[serde(default)]
    pub min_weight: u64,
    /// Holders with more than this weight are excluded (whale cap)
    #[serde(default)]
    pub max_weight: Option<u64>,
    /// Wallets that never receive rewards (pools, the distributor itself)
    #[serde(default)]
    pub excluded_wallets: Vec<String>,
}

impl AllocationPolicy {
    /// Apply exclusions, thresholds and mode to a raw snapshot.
    ///
    /// Duplicate wallets are merged first so thresholds see the full holding.
    pub fn eligible(&self, holders: &[HolderSnapshot]) -> Vec<HolderSnapshot> {
        let excluded: HashSet<&str> = self.excluded_wallets.iter().map(|w| w.as_str()).collect();

        merge_holders(holders)
            .into_iter()
            .filter(|(wallet, _)| !excluded.contains(wallet.as_str()))
            .filter(|(_, weight)| *weight > 0 && *weight >= self.min_weight)
            .filter(|(_, weight)| self.max_weight.map_or(true, |cap| *weight <= cap))
            .map(|(wallet, weight)| HolderSnapshot {
                wallet,
                weight: match self.mode {
                    AllocationMode::Proportional => weight,
                    AllocationMode::Equal => 1,
                },
            })
            .collect()
    }

    /// `eligible` followed by `allocate`
    pub fn allocate(&self, pool: u64, holders: &[HolderSnapshot]) -> Vec<AllocationRow> {
        allocate(pool, &self.eligible(holders))
    }
}

/// Sum weights per wallet (saturating), dropping zero weights
fn merge_holders(holders: &[HolderSnapshot]) -> BTreeMap<String, u64> {
    let mut merged: BTreeMap<String, u64> = BTreeMap::new();
    for h in holders.iter().filter(|h| h.weight > 0) {
        let entry = merged.entry(h.wallet.clone()).or_insert(0);
        *entry = entry.saturating_add(h.weight);
    }
    merged
}

/// Split `pool` base units across `holders` proportionally to weight.
///
/// Returns rows sorted by wallet. Empty when the pool or the total weight is
/// zero.
pub fn allocate(pool: u64, holders: &[HolderSnapshot]) -> Vec<AllocationRow> {
    let merged = merge_holders(holders);
    let total: u128 = merged.values().map(|w| *w as u128).sum();

    if pool == 0 || total == 0 {
        debug!(
            "Nothing to allocate (pool={}, total_weight={}, holders={})",
            pool,
            total,
            merged.len()
        );
        return Vec::new();
    }

    let pool_wide = pool as u128;
    let mut shares: Vec<(&str, u128, u128)> = Vec::with_capacity(merged.len());
    let mut assigned: u128 = 0;
    for (wallet, weight) in &merged {
        let product = pool_wide * (*weight as u128);
        let base = product / total;
        assigned += base;
        shares.push((wallet.as_str(), base, product % total));
    }

    let shortfall = (pool_wide - assigned) as usize;
    if shortfall > 0 {
        let mut order: Vec<usize> = (0..shares.len()).collect();
        // BTreeMap iteration already sorted wallets ascending; a stable sort on
        // remainder keeps that as the tie-break.
        order.sort_by(|a, b| shares[*b].2.cmp(&shares[*a].2));
        for idx in order.into_iter().take(shortfall) {
            shares[idx].1 += 1;
        }
    }

    shares
        .into_iter()
        .filter(|(_, amount, _)| *amount > 0)
        .map(|(wallet, amount, _)| AllocationRow {
            wallet: wallet.to_string(),
            // amount <= pool, which is a u64
            amount: amount as u64,
        })
        .collect()
}

/// Sum of allocated amounts
pub fn total_allocated(rows: &[AllocationRow]) -> u64 {
    rows.iter().map(|r| r.amount).sum()
}
