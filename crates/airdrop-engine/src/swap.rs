//! Swap of claimed fees into the reward token
//!
//! The aggregator (Jupiter-style HTTP API) quotes a route and returns an
//! unsigned versioned transaction. It is signed locally and submitted through
//! the `LedgerClient`, so it gets the same failover and confirmation handling
//! as airdrop batches.
//!
//! A swap is prepared (quoted and signed) before it is sent, so the caller
//! can persist its signature first. After a restart the signature is looked
//! up with `resume` instead of spending the same fees twice.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::VersionedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::ledger_client::{LedgerClient, MintInfo};
use crate::types::{ClaimResult, CycleId, SwapIntent, SwapResult};

/// A signed swap that has not been sent yet
#[derive(Debug, Clone)]
pub struct PreparedSwap {
    pub intent: SwapIntent,
    pub transaction: VersionedTransaction,
}

#[async_trait]
pub trait SwapService: Send + Sync {
    /// Quote and sign a swap of `lamports_in` into the reward token
    async fn prepare(&self, cycle: CycleId, lamports_in: u64) -> Result<PreparedSwap>;

    /// Send a prepared swap and wait for its outcome
    async fn execute(&self, prepared: &PreparedSwap) -> Result<SwapResult>;

    /// Outcome of a swap sent by an earlier run.
    ///
    /// `Ok(None)` means it provably never took effect and may be prepared
    /// again; an error means its fate is still unknown.
    async fn resume(&self, intent: &SwapIntent) -> Result<Option<SwapResult>>;
}

/// How much of a claim goes into the swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapSizing {
    /// Share of the claimed amount to swap, in basis points
    pub share_bps: u16,
    /// Below this the swap is skipped
    pub min_lamports: u64,
    /// Native balance always left in the wallet for fees and rent
    pub reserve_lamports: u64,
}

impl SwapSizing {
    /// Lamports to spend this cycle, or 0 to skip.
    ///
    /// Sized from the claim of the same cycle only; without a claim nothing
    /// is swapped.
    pub fn amount_to_swap(&self, claim: Option<&ClaimResult>, available_lamports: u64) -> u64 {
        let Some(claim) = claim else {
            return 0;
        };
        let share = (claim.amount_moved as u128 * self.share_bps.min(10_000) as u128 / 10_000) as u64;
        let spendable = available_lamports.saturating_sub(self.reserve_lamports);
        let amount = share.min(spendable);
        if amount < self.min_lamports {
            0
        } else {
            amount
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapRequest<'a> {
    quote_response: &'a serde_json::Value,
    user_public_key: String,
    wrap_and_unwrap_sol: bool,
    dynamic_compute_unit_limit: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapResponse {
    swap_transaction: String,
    last_valid_block_height: u64,
}

/// Decode an aggregator transaction and sign it with `payer`
pub fn sign_swap_transaction(encoded: &str, payer: &Keypair) -> Result<VersionedTransaction> {
    let bytes = BASE64.decode(encoded).context("Swap transaction is not base64")?;
    let unsigned: VersionedTransaction =
        bincode::deserialize(&bytes).context("Swap transaction does not decode")?;

    let fee_payer = unsigned
        .message
        .static_account_keys()
        .first()
        .copied()
        .ok_or_else(|| anyhow!("Swap transaction has no accounts"))?;
    if fee_payer != payer.pubkey() {
        bail!("Swap transaction fee payer {} is not {}", fee_payer, payer.pubkey());
    }

    VersionedTransaction::try_new(unsigned.message, &[payer]).context("Failed to sign swap transaction")
}

pub struct JupiterSwapService {
    http: reqwest::Client,
    base_url: String,
    ledger: Arc<LedgerClient>,
    payer: Arc<Keypair>,
    output_mint: Pubkey,
    output_info: MintInfo,
    slippage_bps: u16,
}

impl JupiterSwapService {
    pub fn new(
        base_url: &str,
        ledger: Arc<LedgerClient>,
        payer: Arc<Keypair>,
        output_mint: Pubkey,
        output_info: MintInfo,
        slippage_bps: u16,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build swap HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            ledger,
            payer,
            output_mint,
            output_info,
            slippage_bps,
        })
    }

    async fn quote(&self, lamports_in: u64) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(format!("{}/quote", self.base_url))
            .query(&[
                ("inputMint", spl_token::native_mint::id().to_string()),
                ("outputMint", self.output_mint.to_string()),
                ("amount", lamports_in.to_string()),
                ("slippageBps", self.slippage_bps.to_string()),
            ])
            .send()
            .await
            .context("Quote request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Quote returned {}: {}", status, body);
        }
        response.json().await.context("Invalid quote response")
    }

    async fn reward_balance(&self) -> Result<u64> {
        self.ledger
            .token_balance(&self.payer.pubkey(), &self.output_mint, &self.output_info)
            .await
            .context("Failed to read reward balance")
    }

    /// Result of a confirmed swap, measured against the balance before it
    async fn settle(&self, intent: &SwapIntent) -> Result<SwapResult> {
        let after = self.reward_balance().await?;
        let received = after.saturating_sub(intent.balance_before);
        if received == 0 {
            warn!(
                "[cycle {}] Swap {} confirmed but reward balance did not grow",
                intent.cycle, intent.signature
            );
        }
        info!(
            "[cycle {}] Swapped {} lamports for {} reward units ({})",
            intent.cycle, intent.lamports_in, received, intent.signature
        );
        Ok(SwapResult {
            at: Utc::now(),
            amount_in: intent.lamports_in,
            amount_moved: received,
            reference_id: Some(intent.signature.clone()),
        })
    }
}

#[async_trait]
impl SwapService for JupiterSwapService {
    async fn prepare(&self, cycle: CycleId, lamports_in: u64) -> Result<PreparedSwap> {
        let quote = self.quote(lamports_in).await?;
        let quoted_out = quote
            .get("outAmount")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<u64>().ok());
        debug!("[cycle {}] Quote for {} lamports: {:?} out", cycle, lamports_in, quoted_out);

        let response = self
            .http
            .post(format!("{}/swap", self.base_url))
            .json(&SwapRequest {
                quote_response: &quote,
                user_public_key: self.payer.pubkey().to_string(),
                wrap_and_unwrap_sol: true,
                dynamic_compute_unit_limit: true,
            })
            .send()
            .await
            .context("Swap request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Swap returned {}: {}", status, body);
        }
        let built: SwapResponse = response.json().await.context("Invalid swap response")?;

        let transaction = sign_swap_transaction(&built.swap_transaction, &self.payer)?;
        let signature = transaction
            .signatures
            .first()
            .ok_or_else(|| anyhow!("Signed swap transaction has no signature"))?;
        let balance_before = self.reward_balance().await?;

        Ok(PreparedSwap {
            intent: SwapIntent {
                cycle,
                signature: signature.to_string(),
                last_valid_block_height: built.last_valid_block_height,
                lamports_in,
                balance_before,
            },
            transaction,
        })
    }

    async fn execute(&self, prepared: &PreparedSwap) -> Result<SwapResult> {
        self.ledger
            .submit_and_confirm(&prepared.transaction, prepared.intent.last_valid_block_height)
            .await
            .context("Swap transaction did not confirm")?;
        self.settle(&prepared.intent).await
    }

    async fn resume(&self, intent: &SwapIntent) -> Result<Option<SwapResult>> {
        let signature: Signature = intent
            .signature
            .parse()
            .with_context(|| format!("Invalid swap signature {}", intent.signature))?;
        match self
            .ledger
            .await_confirmation(&signature, intent.last_valid_block_height)
            .await
        {
            Ok(()) => self.settle(intent).await.map(Some),
            Err(e @ LedgerError::Unconfirmed(_)) => {
                Err(anyhow!(e).context(format!("Outcome of swap {} still unknown", intent.signature)))
            }
            Err(e) => {
                info!("[cycle {}] Earlier swap {} did not take effect: {}", intent.cycle, intent.signature, e);
                Ok(None)
            }
        }
    }
}
