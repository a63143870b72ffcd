//! Operations recording
//!
//! Stage results are credited into cumulative totals exactly once per cycle.
//! `Accumulator` asks its `DedupStore` whether `"<kind>:<cycleId>"` was seen
//! and, if not, commits the key together with the updated totals in one
//! store write. A crash between the two is therefore impossible to observe.
//!
//! Publishing to the ops endpoint happens after crediting and never fails
//! the caller.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::types::{AirdropResult, ClaimResult, CycleId, Stage, SwapIntent, SwapResult};

/// Cumulative amounts across all cycles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    /// Lamports claimed
    pub claimed: u64,
    /// Lamports spent on swaps
    pub swapped_in: u64,
    /// Reward units bought
    pub swapped_out: u64,
    /// Reward units delivered
    pub airdropped: u64,
    /// Sum of recipients over all airdrops
    pub recipients: u64,
    pub claims: u64,
    pub swaps: u64,
    pub airdrops: u64,
}

/// Everything the ops ledger remembers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsState {
    pub totals: Totals,
    #[serde(default)]
    pub last_claim: Option<ClaimResult>,
    #[serde(default)]
    pub last_swap: Option<SwapResult>,
    #[serde(default)]
    pub last_airdrop: Option<AirdropResult>,
    /// Swap sent (or about to be) but not yet credited
    #[serde(default)]
    pub swap_intent: Option<SwapIntent>,
}

/// Compare-and-set key store backing the accumulator
pub trait DedupStore: Send {
    fn contains(&self, key: &str) -> bool;

    /// Record `key` and `state` together; both or neither persist
    fn commit(&mut self, key: &str, state: &OpsState) -> Result<()>;

    /// Persist `state` without crediting a key
    fn save(&mut self, state: &OpsState) -> Result<()>;

    /// State as of the last commit
    fn load(&self) -> OpsState;
}

impl<T: DedupStore + ?Sized> DedupStore for Box<T> {
    fn contains(&self, key: &str) -> bool {
        (**self).contains(key)
    }

    fn commit(&mut self, key: &str, state: &OpsState) -> Result<()> {
        (**self).commit(key, state)
    }

    fn save(&mut self, state: &OpsState) -> Result<()> {
        (**self).save(state)
    }

    fn load(&self) -> OpsState {
        (**self).load()
    }
}

/// Idempotent crediting of stage results
pub struct Accumulator<S: DedupStore> {
    store: S,
    state: OpsState,
}

impl<S: DedupStore> Accumulator<S> {
    pub fn new(store: S) -> Self {
        let state = store.load();
        Self { store, state }
    }

    pub fn state(&self) -> &OpsState {
        &self.state
    }

    pub fn totals(&self) -> &Totals {
        &self.state.totals
    }

    /// Whether `stage` of `cycle` was already credited
    pub fn is_recorded(&self, cycle: CycleId, stage: Stage) -> bool {
        self.store.contains(&cycle.key(stage.as_str()))
    }

    /// Apply `update` once for `key`. Returns false if `key` was already
    /// credited. On a store failure nothing changes.
    fn credit(&mut self, key: String, update: impl FnOnce(&mut OpsState)) -> Result<bool> {
        if self.store.contains(&key) {
            debug!("{} already credited", key);
            return Ok(false);
        }
        let mut next = self.state.clone();
        update(&mut next);
        self.store
            .commit(&key, &next)
            .with_context(|| format!("Failed to commit {}", key))?;
        self.state = next;
        Ok(true)
    }

    pub fn credit_claim(&mut self, cycle: CycleId, claim: &ClaimResult) -> Result<bool> {
        self.credit(cycle.key(Stage::Claim.as_str()), |s| {
            s.totals.claimed = s.totals.claimed.saturating_add(claim.amount_moved);
            s.totals.claims += 1;
            s.last_claim = Some(claim.clone());
        })
    }

    pub fn credit_swap(&mut self, cycle: CycleId, swap: &SwapResult) -> Result<bool> {
        self.credit(cycle.key(Stage::Swap.as_str()), |s| {
            s.totals.swapped_in = s.totals.swapped_in.saturating_add(swap.amount_in);
            s.totals.swapped_out = s.totals.swapped_out.saturating_add(swap.amount_moved);
            s.totals.swaps += 1;
            s.last_swap = Some(swap.clone());
            s.swap_intent = None;
        })
    }

    /// Persist (or clear) the in-flight swap. Memory changes only after the
    /// store accepted it.
    pub fn set_swap_intent(&mut self, intent: Option<SwapIntent>) -> Result<()> {
        let mut next = self.state.clone();
        next.swap_intent = intent;
        self.store.save(&next).context("Failed to persist swap intent")?;
        self.state = next;
        Ok(())
    }

    pub fn credit_airdrop(&mut self, cycle: CycleId, airdrop: &AirdropResult) -> Result<bool> {
        self.credit(cycle.key(Stage::Distribute.as_str()), |s| {
            s.totals.airdropped = s.totals.airdropped.saturating_add(airdrop.amount_moved);
            s.totals.recipients = s.totals.recipients.saturating_add(airdrop.recipients as u64);
            s.totals.airdrops += 1;
            s.last_airdrop = Some(airdrop.clone());
        })
    }
}

// ============================================================================
// Publishing
// ============================================================================

/// Payload pushed to the ops endpoint
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_claim: Option<ClaimResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_swap: Option<SwapResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_airdrop: Option<AirdropResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totals: Option<Totals>,
}

#[async_trait]
pub trait OpsSink: Send + Sync {
    async fn publish(&self, report: &OpsReport) -> Result<()>;
}

/// `POST` JSON to the ops endpoint with an `x-ops-secret` header
pub struct HttpOpsSink {
    http: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl HttpOpsSink {
    pub fn new(url: &str, secret: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build ops HTTP client")?;
        Ok(Self {
            http,
            url: url.to_string(),
            secret,
        })
    }
}

#[async_trait]
impl OpsSink for HttpOpsSink {
    async fn publish(&self, report: &OpsReport) -> Result<()> {
        let mut request = self.http.post(&self.url).json(report);
        if let Some(secret) = &self.secret {
            request = request.header("x-ops-secret", secret);
        }
        let response = request.send().await.context("Ops publish failed")?;
        if !response.status().is_success() {
            bail!("Ops endpoint returned {}", response.status());
        }
        Ok(())
    }
}

/// Accumulator plus optional sink, shared by the stage tasks
pub struct OpsRecorder {
    accumulator: Mutex<Accumulator<Box<dyn DedupStore>>>,
    sink: Option<Arc<dyn OpsSink>>,
}

impl OpsRecorder {
    pub fn new(store: Box<dyn DedupStore>, sink: Option<Arc<dyn OpsSink>>) -> Self {
        Self {
            accumulator: Mutex::new(Accumulator::new(store)),
            sink,
        }
    }

    fn with_accumulator<T>(&self, f: impl FnOnce(&mut Accumulator<Box<dyn DedupStore>>) -> T) -> Result<T> {
        let mut guard = self
            .accumulator
            .lock()
            .map_err(|_| anyhow!("ops accumulator lock poisoned"))?;
        Ok(f(&mut guard))
    }

    pub fn state(&self) -> Result<OpsState> {
        self.with_accumulator(|acc| acc.state().clone())
    }

    /// Whether `stage` of `cycle` was credited. A poisoned accumulator is
    /// an error, never "not recorded".
    pub fn is_recorded(&self, cycle: CycleId, stage: Stage) -> Result<bool> {
        self.with_accumulator(|acc| acc.is_recorded(cycle, stage))
    }

    /// The persisted swap intent of `cycle`, if any
    pub fn swap_intent(&self, cycle: CycleId) -> Result<Option<SwapIntent>> {
        self.with_accumulator(|acc| acc.state().swap_intent.clone().filter(|i| i.cycle == cycle))
    }

    /// Persist `intent` before its transaction is sent
    pub fn begin_swap(&self, intent: SwapIntent) -> Result<()> {
        self.with_accumulator(|acc| acc.set_swap_intent(Some(intent)))?
    }

    pub fn clear_swap_intent(&self) -> Result<()> {
        self.with_accumulator(|acc| acc.set_swap_intent(None))?
    }

    pub async fn record_claim(&self, cycle: CycleId, claim: &ClaimResult) -> Result<bool> {
        let (credited, totals) =
            self.with_accumulator(|acc| acc.credit_claim(cycle, claim).map(|c| (c, acc.totals().clone())))??;
        if credited {
            self.publish(OpsReport {
                last_claim: Some(claim.clone()),
                totals: Some(totals),
                ..Default::default()
            })
            .await;
        }
        Ok(credited)
    }

    pub async fn record_swap(&self, cycle: CycleId, swap: &SwapResult) -> Result<bool> {
        let (credited, totals) =
            self.with_accumulator(|acc| acc.credit_swap(cycle, swap).map(|c| (c, acc.totals().clone())))??;
        if credited {
            self.publish(OpsReport {
                last_swap: Some(swap.clone()),
                totals: Some(totals),
                ..Default::default()
            })
            .await;
        }
        Ok(credited)
    }

    pub async fn record_airdrop(&self, cycle: CycleId, airdrop: &AirdropResult) -> Result<bool> {
        let (credited, totals) = self
            .with_accumulator(|acc| acc.credit_airdrop(cycle, airdrop).map(|c| (c, acc.totals().clone())))??;
        if credited {
            info!(
                "[cycle {}] Totals: claimed {}, swapped {} -> {}, airdropped {} to {} recipients",
                cycle, totals.claimed, totals.swapped_in, totals.swapped_out, totals.airdropped, totals.recipients
            );
            self.publish(OpsReport {
                last_airdrop: Some(airdrop.clone()),
                totals: Some(totals),
                ..Default::default()
            })
            .await;
        }
        Ok(credited)
    }

    async fn publish(&self, report: OpsReport) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Err(e) = sink.publish(&report).await {
            warn!("Ops publish failed (ignored): {:#}", e);
        }
    }
}
