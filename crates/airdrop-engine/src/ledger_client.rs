//! Ledger access with endpoint failover
//!
//! `LedgerRpc` is the set of primitive calls one RPC endpoint offers.
//! `LedgerClient` owns an ordered list of endpoints and runs every call in a
//! bounded retry loop: a transient failure rotates the active endpoint, waits
//! `base * 2^attempt` plus jitter, and repeats the call from scratch with the
//! same request data. Non-transient failures are returned immediately.
//!
//! Submission is at-most-once per signature: `submit_and_confirm` only ever
//! resends the identical signed transaction and reports `BlockhashExpired`
//! only once the block height has passed the transaction's last valid height
//! without the signature landing.

use async_trait::async_trait;
use rand::Rng;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use spl_associated_token_account::get_associated_token_address_with_program_id;
use spl_token_2022::extension::StateWithExtensions;
use spl_token_2022::state::{Account as TokenAccount, Mint};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::types::HolderSnapshot;

// ============================================================================
// Endpoint primitives
// ============================================================================

/// Recent block reference a transaction is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockReference {
    pub blockhash: Hash,
    /// Block height after which a transaction using `blockhash` can no
    /// longer land
    pub last_valid_block_height: u64,
}

/// Raw account as returned by `getAccountInfo`
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    /// Owning program
    pub owner: Pubkey,
    pub lamports: u64,
    pub data: Vec<u8>,
}

/// Parsed token account from a program-wide scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenAccountRecord {
    pub owner: Pubkey,
    pub amount: u64,
}

/// Status of a previously sent signature
#[derive(Debug, Clone)]
pub enum SignatureState {
    /// Not seen yet, or seen below the required commitment
    Pending,
    Confirmed,
    /// Landed with an error
    Failed(LedgerError),
}

/// Primitive operations of one RPC endpoint.
///
/// Implementations map provider errors into `LedgerError` themselves.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Endpoint URL, for logging
    fn url(&self) -> &str;

    /// All token accounts of `mint` owned by `token_program`
    async fn token_accounts(
        &self,
        token_program: &Pubkey,
        mint: &Pubkey,
    ) -> LedgerResult<Vec<TokenAccountRecord>>;

    async fn account(&self, address: &Pubkey) -> LedgerResult<Option<AccountSnapshot>>;

    async fn latest_block_reference(&self) -> LedgerResult<BlockReference>;

    async fn block_height(&self) -> LedgerResult<u64>;

    async fn send_transaction(&self, tx: &VersionedTransaction) -> LedgerResult<Signature>;

    async fn signature_state(&self, signature: &Signature) -> LedgerResult<SignatureState>;
}

// ============================================================================
// Client
// ============================================================================

/// Retry and confirmation tuning
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Attempts per call across all endpoints
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Delay between signature-status polls
    pub confirm_poll_interval: Duration,
    /// Give up polling after this long even if expiry was not observed
    pub confirm_timeout: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            confirm_poll_interval: Duration::from_secs(2),
            confirm_timeout: Duration::from_secs(120),
        }
    }
}

/// Token program and decimals of a mint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MintInfo {
    pub program_id: Pubkey,
    pub decimals: u8,
}

/// Exponential backoff with up to 10% jitter, capped at `max`
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let delay = base_ms.saturating_mul(2_u64.saturating_pow(attempt.min(20)));
    let jitter = rand::thread_rng().gen_range(0..delay / 10 + 1);
    Duration::from_millis(delay.saturating_add(jitter)).min(max)
}

/// The token programs whose accounts make up a holder snapshot
pub fn token_programs() -> [Pubkey; 2] {
    [spl_token::id(), spl_token_2022::id()]
}

pub struct LedgerClient {
    endpoints: Vec<Arc<dyn LedgerRpc>>,
    active: AtomicUsize,
    settings: LedgerSettings,
}

impl LedgerClient {
    pub fn new(endpoints: Vec<Arc<dyn LedgerRpc>>, settings: LedgerSettings) -> anyhow::Result<Self> {
        if endpoints.is_empty() {
            anyhow::bail!("LedgerClient needs at least one RPC endpoint");
        }
        Ok(Self {
            endpoints,
            active: AtomicUsize::new(0),
            settings,
        })
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// URL of the endpoint the next call will use
    pub fn active_url(&self) -> &str {
        self.current().1.url()
    }

    fn current(&self) -> (usize, &Arc<dyn LedgerRpc>) {
        let idx = self.active.load(Ordering::Acquire) % self.endpoints.len();
        (idx, &self.endpoints[idx])
    }

    /// Move off endpoint `from`. A no-op if a concurrent call already rotated.
    fn rotate_from(&self, from: usize) {
        let next = (from + 1) % self.endpoints.len();
        if self
            .active
            .compare_exchange(from, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && next != from
        {
            info!(
                "Switching RPC endpoint {} -> {}",
                self.endpoints[from].url(),
                self.endpoints[next].url()
            );
        }
    }

    /// Run `op` against the active endpoint with bounded retries and rotation
    async fn call<T, F, Fut>(&self, name: &str, op: F) -> LedgerResult<T>
    where
        F: Fn(Arc<dyn LedgerRpc>) -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let (idx, endpoint) = self.current();
            let url = endpoint.url().to_string();
            match op(endpoint.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable_call() && attempt + 1 < max_attempts => {
                    self.rotate_from(idx);
                    let delay =
                        backoff_delay(attempt, self.settings.base_delay, self.settings.max_delay);
                    warn!(
                        "{} failed on {} (attempt {}/{}): {}, retrying in {}ms",
                        name,
                        url,
                        attempt + 1,
                        max_attempts,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable_call() {
                        warn!("{} failed after {} attempts: {}", name, max_attempts, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Current holders of `mint` across every token program, one entry per
    /// owner with balances summed. Zero balances are skipped. Sorted by
    /// wallet.
    pub async fn enumerate_holders(&self, mint: &Pubkey) -> LedgerResult<Vec<HolderSnapshot>> {
        let mut by_owner: BTreeMap<String, u64> = BTreeMap::new();

        for program in token_programs() {
            let records = self
                .call("getProgramAccounts", |ep| async move {
                    ep.token_accounts(&program, mint).await
                })
                .await?;
            debug!("{} token accounts for {} under {}", records.len(), mint, program);

            for record in records.into_iter().filter(|r| r.amount > 0) {
                let entry = by_owner.entry(record.owner.to_string()).or_insert(0);
                *entry = entry.saturating_add(record.amount);
            }
        }

        info!("Enumerated {} holders of {}", by_owner.len(), mint);
        Ok(by_owner
            .into_iter()
            .map(|(wallet, weight)| HolderSnapshot { wallet, weight })
            .collect())
    }

    pub async fn account(&self, address: &Pubkey) -> LedgerResult<Option<AccountSnapshot>> {
        self.call("getAccountInfo", |ep| async move { ep.account(address).await })
            .await
    }

    /// Owning token program and decimals of `mint`
    pub async fn mint_info(&self, mint: &Pubkey) -> LedgerResult<MintInfo> {
        let account = self
            .account(mint)
            .await?
            .ok_or_else(|| LedgerError::InvalidResponse(format!("mint {} not found", mint)))?;

        if !token_programs().contains(&account.owner) {
            return Err(LedgerError::InvalidResponse(format!(
                "{} is owned by {}, not a token program",
                mint, account.owner
            )));
        }

        let state = StateWithExtensions::<Mint>::unpack(&account.data).map_err(|e| {
            LedgerError::InvalidResponse(format!("cannot parse mint {}: {}", mint, e))
        })?;

        Ok(MintInfo {
            program_id: account.owner,
            decimals: state.base.decimals,
        })
    }

    /// Balance of `owner`'s associated token account for `mint` (0 if absent)
    pub async fn token_balance(&self, owner: &Pubkey, mint: &Pubkey, info: &MintInfo) -> LedgerResult<u64> {
        let ata = get_associated_token_address_with_program_id(owner, mint, &info.program_id);
        let Some(account) = self.account(&ata).await? else {
            return Ok(0);
        };
        let state = StateWithExtensions::<TokenAccount>::unpack(&account.data).map_err(|e| {
            LedgerError::InvalidResponse(format!("cannot parse token account {}: {}", ata, e))
        })?;
        Ok(state.base.amount)
    }

    /// Native balance in lamports (0 if the account does not exist)
    pub async fn lamports(&self, address: &Pubkey) -> LedgerResult<u64> {
        Ok(self.account(address).await?.map(|a| a.lamports).unwrap_or(0))
    }

    pub async fn latest_block_reference(&self) -> LedgerResult<BlockReference> {
        self.call("getLatestBlockhash", |ep| async move { ep.latest_block_reference().await })
            .await
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Send `tx` and wait until it is confirmed, fails, or its block
    /// reference expires.
    ///
    /// An ambiguous send failure (transient error after the request may have
    /// reached a node) is not treated as a failure: the signature is polled
    /// until the outcome is known.
    pub async fn submit_and_confirm(
        &self,
        tx: &VersionedTransaction,
        last_valid_block_height: u64,
    ) -> LedgerResult<Signature> {
        let signature = *tx
            .signatures
            .first()
            .ok_or_else(|| LedgerError::Rejected("transaction is not signed".to_string()))?;

        match self
            .call("sendTransaction", |ep| async move { ep.send_transaction(tx).await })
            .await
        {
            Ok(_) => debug!("Sent {}", signature),
            Err(LedgerError::BlockhashExpired) => return Err(LedgerError::BlockhashExpired),
            Err(e) if e.is_transient() => {
                warn!("Send outcome of {} unknown ({}), polling status", signature, e);
            }
            Err(e) => return Err(e),
        }

        self.await_confirmation(&signature, last_valid_block_height).await?;
        Ok(signature)
    }

    /// Poll `signature` until it confirms, fails or its block reference expires
    pub async fn await_confirmation(&self, signature: &Signature, last_valid_block_height: u64) -> LedgerResult<()> {
        let started = Instant::now();
        loop {
            match self.signature_state(signature).await {
                Ok(SignatureState::Confirmed) => return Ok(()),
                Ok(SignatureState::Failed(e)) => return Err(e),
                Ok(SignatureState::Pending) => {}
                Err(e) => debug!("Status poll for {} failed: {}", signature, e),
            }

            match self.call("getBlockHeight", |ep| async move { ep.block_height().await }).await {
                Ok(height) if height > last_valid_block_height => {
                    // The signature may have landed between the two reads
                    return match self.signature_state(signature).await {
                        Ok(SignatureState::Confirmed) => Ok(()),
                        Ok(SignatureState::Failed(e)) => Err(e),
                        Ok(SignatureState::Pending) => Err(LedgerError::BlockhashExpired),
                        Err(_) => Err(LedgerError::Unconfirmed(signature.to_string())),
                    };
                }
                Ok(_) => {}
                Err(e) => debug!("Block height poll failed: {}", e),
            }

            if started.elapsed() >= self.settings.confirm_timeout {
                warn!(
                    "Gave up on {} after {}s without confirmation or expiry",
                    signature,
                    started.elapsed().as_secs()
                );
                return Err(LedgerError::Unconfirmed(signature.to_string()));
            }
            tokio::time::sleep(self.settings.confirm_poll_interval).await;
        }
    }

    async fn signature_state(&self, signature: &Signature) -> LedgerResult<SignatureState> {
        self.call("getSignatureStatuses", |ep| async move {
            ep.signature_state(signature).await
        })
        .await
    }
}
