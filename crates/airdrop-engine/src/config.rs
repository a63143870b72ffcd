//! Engine configuration
//!
//! Assembled from two sources:
//! 1. `.env` / environment: mints, wallet key, RPC endpoints, service URLs
//! 2. `distributor.toml`: timing, batching, allocation and swap tuning
//!
//! A missing `distributor.toml` means all defaults. Required environment
//! variables missing, or values that contradict each other, fail `load`
//! before anything runs.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::signer::keypair::keypair_from_seed;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::allocation::AllocationPolicy;
use crate::cycle::CycleSchedule;
use crate::ledger_client::LedgerSettings;
use crate::submitter::SubmitterSettings;
use crate::swap::SwapSizing;

// ============================================================================
// distributor.toml
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DistributorToml {
    #[serde(default)]
    cycle: CycleToml,
    #[serde(default)]
    batch: BatchToml,
    #[serde(default)]
    allocation: AllocationToml,
    #[serde(default)]
    swap: SwapToml,
    #[serde(default)]
    ledger: LedgerToml,
}

/// `[cycle]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleToml {
    #[serde(default = "default_width_secs")]
    pub width_secs: u64,
    #[serde(default)]
    pub claim_offset_secs: u64,
    #[serde(default = "default_swap_offset_secs")]
    pub swap_offset_secs: u64,
    #[serde(default = "default_distribute_offset_secs")]
    pub distribute_offset_secs: u64,
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
    #[serde(default = "default_swap_timeout_secs")]
    pub swap_timeout_secs: u64,
    #[serde(default = "default_distribute_timeout_secs")]
    pub distribute_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for CycleToml {
    fn default() -> Self {
        Self {
            width_secs: default_width_secs(),
            claim_offset_secs: 0,
            swap_offset_secs: default_swap_offset_secs(),
            distribute_offset_secs: default_distribute_offset_secs(),
            claim_timeout_secs: default_claim_timeout_secs(),
            swap_timeout_secs: default_swap_timeout_secs(),
            distribute_timeout_secs: default_distribute_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// `[batch]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchToml {
    #[serde(default = "default_initial_width")]
    pub initial_width: usize,
    #[serde(default = "default_max_width")]
    pub max_width: usize,
    #[serde(default = "default_grow_after")]
    pub grow_after: u32,
    #[serde(default = "default_max_batch_attempts")]
    pub max_batch_attempts: u32,
    #[serde(default = "default_wave_concurrency")]
    pub wave_concurrency: usize,
    #[serde(default = "default_min_submit_gap_ms")]
    pub min_submit_gap_ms: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Priority fee, micro-lamports per compute unit
    #[serde(default = "default_compute_unit_price")]
    pub compute_unit_price: u64,
    #[serde(default = "default_base_compute_units")]
    pub base_compute_units: u32,
    #[serde(default = "default_compute_units_per_recipient")]
    pub compute_units_per_recipient: u32,
}

impl Default for BatchToml {
    fn default() -> Self {
        Self {
            initial_width: default_initial_width(),
            max_width: default_max_width(),
            grow_after: default_grow_after(),
            max_batch_attempts: default_max_batch_attempts(),
            wave_concurrency: default_wave_concurrency(),
            min_submit_gap_ms: default_min_submit_gap_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            compute_unit_price: default_compute_unit_price(),
            base_compute_units: default_base_compute_units(),
            compute_units_per_recipient: default_compute_units_per_recipient(),
        }
    }
}

/// `[allocation]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationToml {
    /// Share of the distributor's reward balance paid out per cycle
    #[serde(default = "default_bps")]
    pub pool_bps: u16,
    /// Skip the airdrop when the pool is smaller than this
    #[serde(default)]
    pub min_pool: u64,
    #[serde(flatten)]
    pub policy: AllocationPolicy,
}

impl Default for AllocationToml {
    fn default() -> Self {
        Self {
            pool_bps: default_bps(),
            min_pool: 0,
            policy: AllocationPolicy::default(),
        }
    }
}

/// `[swap]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapToml {
    #[serde(default = "default_swap_share_bps")]
    pub share_bps: u16,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u16,
    #[serde(default = "default_min_swap_lamports")]
    pub min_lamports: u64,
    #[serde(default = "default_reserve_lamports")]
    pub reserve_lamports: u64,
}

impl Default for SwapToml {
    fn default() -> Self {
        Self {
            share_bps: default_swap_share_bps(),
            slippage_bps: default_slippage_bps(),
            min_lamports: default_min_swap_lamports(),
            reserve_lamports: default_reserve_lamports(),
        }
    }
}

/// `[ledger]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerToml {
    #[serde(default = "default_commitment")]
    pub commitment: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_confirm_poll_ms")]
    pub confirm_poll_ms: u64,
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    /// Per-request timeout for RPC and HTTP services
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for LedgerToml {
    fn default() -> Self {
        Self {
            commitment: default_commitment(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            confirm_poll_ms: default_confirm_poll_ms(),
            confirm_timeout_secs: default_confirm_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ============================================================================
// EngineConfig
// ============================================================================

/// Everything the engine needs to run
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // From env
    pub tracked_mint: Pubkey,
    pub reward_mint: Pubkey,
    pub keypair: Arc<Keypair>,
    pub rpc_urls: Vec<String>,
    pub fee_claim_url: Option<String>,
    pub swap_api_url: Option<String>,
    pub ops_endpoint_url: Option<String>,
    pub ops_secret: Option<String>,
    pub state_file: PathBuf,

    // From distributor.toml
    pub cycle: CycleToml,
    pub batch: BatchToml,
    pub allocation: AllocationToml,
    pub swap: SwapToml,
    pub ledger: LedgerToml,
}

impl EngineConfig {
    /// Load from the process environment and `toml_path` (optional file)
    pub fn load<P: AsRef<Path>>(toml_path: P) -> Result<Self> {
        let path = toml_path.as_ref();
        let toml_str = if path.exists() {
            Some(fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?)
        } else {
            tracing::info!("{} not found, using default tuning", path.display());
            None
        };
        Self::from_sources(toml_str.as_deref(), |name| std::env::var(name).ok())
            .with_context(|| format!("Invalid configuration ({})", path.display()))
    }

    /// Build from TOML text and an environment lookup
    pub fn from_sources(toml_str: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file: DistributorToml = match toml_str {
            Some(s) => toml::from_str(s).context("Failed to parse distributor TOML")?,
            None => DistributorToml::default(),
        };

        let required = |name: &str| env(name).filter(|v| !v.trim().is_empty()).ok_or_else(|| anyhow!("{} env var is required", name));
        let optional = |name: &str| env(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let tracked_mint = parse_pubkey("TRACKED_MINT", &required("TRACKED_MINT")?)?;
        let reward_mint = parse_pubkey("REWARD_MINT", &required("REWARD_MINT")?)?;
        let keypair = Arc::new(decode_keypair(&required("WALLET_PRIVATE_KEY")?)?);
        let rpc_urls: Vec<String> = required("RPC_URLS")?
            .split(',')
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();

        let mut allocation = file.allocation;
        let own_wallet = keypair.pubkey().to_string();
        if !allocation.policy.excluded_wallets.contains(&own_wallet) {
            allocation.policy.excluded_wallets.push(own_wallet);
        }

        let config = EngineConfig {
            tracked_mint,
            reward_mint,
            keypair,
            rpc_urls,
            fee_claim_url: optional("FEE_CLAIM_URL"),
            swap_api_url: optional("SWAP_API_URL"),
            ops_endpoint_url: optional("OPS_ENDPOINT_URL"),
            ops_secret: optional("OPS_SECRET"),
            state_file: optional("STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ops-ledger.json")),
            cycle: file.cycle,
            batch: file.batch,
            allocation,
            swap: file.swap,
            ledger: file.ledger,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot work together
    pub fn validate(&self) -> Result<()> {
        if self.rpc_urls.is_empty() {
            bail!("RPC_URLS must list at least one endpoint");
        }
        for url in &self.rpc_urls {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("RPC URL {} must be http(s)", url);
            }
        }

        let schedule = self.schedule()?;
        let width = schedule.width();
        for (name, timeout) in [
            ("claim", self.cycle.claim_timeout_secs),
            ("swap", self.cycle.swap_timeout_secs),
            ("distribute", self.cycle.distribute_timeout_secs),
        ] {
            if timeout == 0 || Duration::from_secs(timeout) > width {
                bail!(
                    "{} timeout {}s must be positive and at most the {}s cycle",
                    name,
                    timeout,
                    width.as_secs()
                );
            }
        }
        if self.cycle.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be positive");
        }

        let b = &self.batch;
        if b.initial_width == 0 || b.max_width < b.initial_width {
            bail!(
                "Batch widths must satisfy 1 <= initial_width ({}) <= max_width ({})",
                b.initial_width,
                b.max_width
            );
        }
        if b.max_batch_attempts == 0 || b.wave_concurrency == 0 || b.grow_after == 0 {
            bail!("max_batch_attempts, wave_concurrency and grow_after must be positive");
        }

        for (name, bps) in [
            ("allocation.pool_bps", self.allocation.pool_bps),
            ("swap.share_bps", self.swap.share_bps),
            ("swap.slippage_bps", self.swap.slippage_bps),
        ] {
            if bps > 10_000 {
                bail!("{} must be at most 10000, got {}", name, bps);
            }
        }
        if let Some(cap) = self.allocation.policy.max_weight {
            if cap < self.allocation.policy.min_weight {
                bail!("allocation.max_weight {} is below min_weight {}", cap, self.allocation.policy.min_weight);
            }
        }

        if self.ledger.max_attempts == 0 {
            bail!("ledger.max_attempts must be positive");
        }
        parse_commitment(&self.ledger.commitment)?;
        Ok(())
    }

    /// The distributor wallet's address
    pub fn distributor(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn schedule(&self) -> Result<CycleSchedule> {
        CycleSchedule::new(
            Duration::from_secs(self.cycle.width_secs),
            Duration::from_secs(self.cycle.claim_offset_secs),
            Duration::from_secs(self.cycle.swap_offset_secs),
            Duration::from_secs(self.cycle.distribute_offset_secs),
        )
    }

    pub fn submitter_settings(&self) -> SubmitterSettings {
        let b = &self.batch;
        SubmitterSettings {
            initial_width: b.initial_width,
            max_width: b.max_width,
            grow_after: b.grow_after,
            max_batch_attempts: b.max_batch_attempts,
            wave_concurrency: b.wave_concurrency,
            min_submit_gap: Duration::from_millis(b.min_submit_gap_ms),
            retry_base_delay: Duration::from_millis(b.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(b.retry_max_delay_ms),
        }
    }

    pub fn ledger_settings(&self) -> LedgerSettings {
        let l = &self.ledger;
        LedgerSettings {
            max_attempts: l.max_attempts,
            base_delay: Duration::from_millis(l.base_delay_ms),
            max_delay: Duration::from_millis(l.max_delay_ms),
            confirm_poll_interval: Duration::from_millis(l.confirm_poll_ms),
            confirm_timeout: Duration::from_secs(l.confirm_timeout_secs),
        }
    }

    pub fn swap_sizing(&self) -> SwapSizing {
        SwapSizing {
            share_bps: self.swap.share_bps,
            min_lamports: self.swap.min_lamports,
            reserve_lamports: self.swap.reserve_lamports,
        }
    }

    pub fn commitment(&self) -> Result<CommitmentConfig> {
        parse_commitment(&self.ledger.commitment)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.ledger.request_timeout_secs)
    }

    pub fn stage_timeouts(&self) -> [Duration; 3] {
        [
            Duration::from_secs(self.cycle.claim_timeout_secs),
            Duration::from_secs(self.cycle.swap_timeout_secs),
            Duration::from_secs(self.cycle.distribute_timeout_secs),
        ]
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_pubkey(name: &str, value: &str) -> Result<Pubkey> {
    Pubkey::from_str(value.trim()).map_err(|e| anyhow!("{} is not a valid address: {}", name, e))
}

fn parse_commitment(value: &str) -> Result<CommitmentConfig> {
    match value.to_ascii_lowercase().as_str() {
        "processed" => Ok(CommitmentConfig::processed()),
        "confirmed" => Ok(CommitmentConfig::confirmed()),
        "finalized" => Ok(CommitmentConfig::finalized()),
        other => bail!("Unknown commitment level {:?}", other),
    }
}

/// Decode a wallet key: base58 of a 64-byte keypair or 32-byte seed, or a
/// JSON byte array as written by `solana-keygen`
pub fn decode_keypair(encoded: &str) -> Result<Keypair> {
    let encoded = encoded.trim();
    let key_bytes: Vec<u8> = if encoded.starts_with('[') {
        serde_json::from_str(encoded).context("Invalid JSON byte array private key")?
    } else {
        bs58::decode(encoded)
            .into_vec()
            .context("Invalid base58 private key")?
    };

    match key_bytes.len() {
        64 => Keypair::from_bytes(&key_bytes).map_err(|e| anyhow!("Invalid keypair bytes: {}", e)),
        32 => keypair_from_seed(&key_bytes).map_err(|e| anyhow!("Invalid private key seed: {}", e)),
        n => bail!("Private key must be 32 or 64 bytes, got {}", n),
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_width_secs() -> u64 {
    300
}

fn default_swap_offset_secs() -> u64 {
    60
}

fn default_distribute_offset_secs() -> u64 {
    120
}

fn default_claim_timeout_secs() -> u64 {
    50
}

fn default_swap_timeout_secs() -> u64 {
    55
}

fn default_distribute_timeout_secs() -> u64 {
    170
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_initial_width() -> usize {
    8
}

fn default_max_width() -> usize {
    9
}

fn default_grow_after() -> u32 {
    3
}

fn default_max_batch_attempts() -> u32 {
    5
}

fn default_wave_concurrency() -> usize {
    4
}

fn default_min_submit_gap_ms() -> u64 {
    250
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    16_000
}

fn default_compute_unit_price() -> u64 {
    50_000
}

fn default_base_compute_units() -> u32 {
    10_000
}

fn default_compute_units_per_recipient() -> u32 {
    40_000
}

fn default_bps() -> u16 {
    10_000
}

fn default_swap_share_bps() -> u16 {
    9_000
}

fn default_slippage_bps() -> u16 {
    100
}

fn default_min_swap_lamports() -> u64 {
    10_000_000 // 0.01 SOL
}

fn default_reserve_lamports() -> u64 {
    50_000_000 // 0.05 SOL
}

fn default_commitment() -> String {
    "confirmed".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_confirm_poll_ms() -> u64 {
    2_000
}

fn default_confirm_timeout_secs() -> u64 {
    90
}

fn default_request_timeout_secs() -> u64 {
    30
}
