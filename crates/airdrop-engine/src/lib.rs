//! Airdrop engine - fee claim, swap and proportional airdrop on a fixed cycle
//!
//! Each cycle claims accrued fees, swaps a share of them into the reward
//! token and distributes the reward balance to holders of a tracked token in
//! proportion to their holdings.
//!
//! Key components:
//! - Cycle scheduling on a wall-clock grid (`cycle`, `runner`)
//! - Largest-remainder allocation (`allocation`)
//! - Adaptive batched submission with retry and RPC failover (`submitter`, `ledger_client`)
//! - Exactly-once accounting of stage results (`ops`, `state`)

pub mod allocation;
pub mod config;
pub mod cycle;
pub mod error;
pub mod fee_claim;
pub mod ledger_client;
pub mod logging;
pub mod ops;
pub mod runner;
pub mod solana_rpc;
pub mod state;
pub mod submitter;
pub mod swap;
pub mod tx_builder;
pub mod types;

#[cfg(test)]
mod test_support;
