//! Fee-claim service client
//!
//! The claim itself is performed by an external service; this side only
//! asks for it with an idempotency key per cycle, so a repeated request for
//! the same cycle cannot claim twice.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::types::{ClaimResult, CycleId, Stage};

#[async_trait]
pub trait FeeClaimService: Send + Sync {
    /// Claim accrued fees into the distributor wallet for `cycle`
    async fn claim(&self, cycle: CycleId) -> Result<ClaimResult>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaimRequest<'a> {
    idempotency_key: &'a str,
    wallet: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimResponse {
    amount_claimed: u64,
    #[serde(default)]
    signature: Option<String>,
}

/// `POST <url>` with an `Idempotency-Key: claim:<cycleId>` header
pub struct HttpFeeClaimService {
    http: reqwest::Client,
    url: String,
    wallet: String,
}

impl HttpFeeClaimService {
    pub fn new(url: &str, wallet: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build fee-claim HTTP client")?;
        Ok(Self {
            http,
            url: url.to_string(),
            wallet: wallet.to_string(),
        })
    }
}

#[async_trait]
impl FeeClaimService for HttpFeeClaimService {
    async fn claim(&self, cycle: CycleId) -> Result<ClaimResult> {
        let key = cycle.key(Stage::Claim.as_str());
        debug!("Requesting fee claim {} for {}", key, self.wallet);

        let response = self
            .http
            .post(&self.url)
            .header("Idempotency-Key", &key)
            .json(&ClaimRequest {
                idempotency_key: &key,
                wallet: &self.wallet,
            })
            .send()
            .await
            .with_context(|| format!("Fee-claim request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Fee-claim service returned {}: {}", status, body);
        }

        let parsed: ClaimResponse = response
            .json()
            .await
            .context("Invalid fee-claim response")?;
        info!(
            "[cycle {}] Claimed {} lamports{}",
            cycle,
            parsed.amount_claimed,
            parsed
                .signature
                .as_deref()
                .map(|s| format!(" ({})", s))
                .unwrap_or_default()
        );

        Ok(ClaimResult {
            at: Utc::now(),
            amount_moved: parsed.amount_claimed,
            reference_id: parsed.signature,
        })
    }
}
