//! Configuration for the airdrop worker
//!
//! Uses `EngineConfig` from `airdrop-engine` directly: env vars (after
//! `.env`) for identity and endpoints, `distributor.toml` for tuning.

use anyhow::Result;
use std::path::Path;

use airdrop_engine::config::EngineConfig;

/// Load worker configuration from the environment and `toml_path`.
///
/// A missing TOML file means default tuning; missing env vars are errors.
pub fn load<P: AsRef<Path>>(toml_path: P) -> Result<EngineConfig> {
    EngineConfig::load(toml_path)
}
