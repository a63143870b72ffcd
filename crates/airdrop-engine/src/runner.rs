//! Distribution cycle runner: event loop, stage execution, shutdown
//!
//! `Engine` holds the collaborators of one cycle (ledger, services, ops
//! recorder) and knows how to run each stage. `CycleRunner` owns the
//! `CycleTracker` and drives the engine from a polling loop: every tick asks
//! the tracker which stages are due and runs them in order, each as a
//! spawned task under its own hard timeout.

use anyhow::{Context, Result};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::allocation::{total_allocated, AllocationPolicy};
use crate::config::EngineConfig;
use crate::cycle::{Clock, CycleSchedule, CycleTracker, SystemClock};
use crate::fee_claim::{FeeClaimService, HttpFeeClaimService};
use crate::ledger_client::{LedgerClient, LedgerRpc, MintInfo};
use crate::ops::{HttpOpsSink, OpsRecorder, OpsSink};
use crate::solana_rpc::SolanaEndpoint;
use crate::state::{FileDedupStore, DEFAULT_KEY_HISTORY};
use crate::submitter::{BatchSubmitter, DistributionReport};
use crate::swap::{JupiterSwapService, SwapService, SwapSizing};
use crate::tx_builder::TransferPlan;
use crate::types::{AllocationRow, ClaimResult, CycleId, Stage, SwapResult};

/// Stages that move the reward balance; two of them never overlap
fn moves_reward_balance(stage: Stage) -> bool {
    matches!(stage, Stage::Swap | Stage::Distribute)
}

/// Share of `balance` paid out, in basis points (capped at 100%)
pub fn pool_from_balance(balance: u64, pool_bps: u16) -> u64 {
    (balance as u128 * pool_bps.min(10_000) as u128 / 10_000) as u64
}

/// Hard limit per stage invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub claim: Duration,
    pub swap: Duration,
    pub distribute: Duration,
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Claim => self.claim,
            Stage::Swap => self.swap,
            Stage::Distribute => self.distribute,
        }
    }
}

impl From<[Duration; 3]> for StageTimeouts {
    fn from([claim, swap, distribute]: [Duration; 3]) -> Self {
        Self { claim, swap, distribute }
    }
}

/// What a distribution would pay out right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    /// Distributor's reward-token balance
    pub balance: u64,
    pub pool: u64,
    /// Distinct holders before eligibility rules
    pub holders: usize,
    pub rows: Vec<AllocationRow>,
}

/// Collaborators of a distribution cycle
pub struct Engine {
    pub ledger: Arc<LedgerClient>,
    pub payer: Arc<Keypair>,
    pub tracked_mint: Pubkey,
    pub reward_mint: Pubkey,
    pub reward_info: MintInfo,
    pub submitter: BatchSubmitter,
    pub fee_claim: Option<Arc<dyn FeeClaimService>>,
    pub swap: Option<Arc<dyn SwapService>>,
    pub swap_sizing: SwapSizing,
    pub policy: AllocationPolicy,
    pub pool_bps: u16,
    pub min_pool: u64,
    pub ops: Arc<OpsRecorder>,
}

impl Engine {
    /// Wire the engine from configuration.
    ///
    /// Reads the reward mint from the ledger, so this fails early when no
    /// endpoint is reachable or the mint is wrong.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let commitment = config.commitment()?;
        let endpoints: Vec<Arc<dyn LedgerRpc>> = config
            .rpc_urls
            .iter()
            .map(|url| {
                Arc::new(SolanaEndpoint::new(url, config.request_timeout(), commitment)) as Arc<dyn LedgerRpc>
            })
            .collect();
        let ledger = Arc::new(LedgerClient::new(endpoints, config.ledger_settings())?);
        let payer = config.keypair.clone();

        let reward_info = ledger
            .mint_info(&config.reward_mint)
            .await
            .with_context(|| format!("Failed to read reward mint {}", config.reward_mint))?;
        info!(
            "Reward mint {} ({} decimals, program {})",
            config.reward_mint, reward_info.decimals, reward_info.program_id
        );

        let plan = TransferPlan {
            mint: config.reward_mint,
            token_program: reward_info.program_id,
            decimals: reward_info.decimals,
            compute_unit_price: config.batch.compute_unit_price,
            base_compute_units: config.batch.base_compute_units,
            compute_units_per_recipient: config.batch.compute_units_per_recipient,
        };
        let submitter = BatchSubmitter::new(ledger.clone(), payer.clone(), plan, config.submitter_settings());

        let fee_claim = match &config.fee_claim_url {
            Some(url) => Some(Arc::new(HttpFeeClaimService::new(
                url,
                &payer.pubkey().to_string(),
                config.request_timeout(),
            )?) as Arc<dyn FeeClaimService>),
            None => {
                warn!("FEE_CLAIM_URL not set, claim stage disabled");
                None
            }
        };
        let swap = match &config.swap_api_url {
            Some(url) => Some(Arc::new(JupiterSwapService::new(
                url,
                ledger.clone(),
                payer.clone(),
                config.reward_mint,
                reward_info,
                config.swap.slippage_bps,
                config.request_timeout(),
            )?) as Arc<dyn SwapService>),
            None => {
                warn!("SWAP_API_URL not set, swap stage disabled");
                None
            }
        };

        let sink = match &config.ops_endpoint_url {
            Some(url) => Some(
                Arc::new(HttpOpsSink::new(url, config.ops_secret.clone(), config.request_timeout())?)
                    as Arc<dyn OpsSink>,
            ),
            None => None,
        };
        let store = FileDedupStore::open(&config.state_file, DEFAULT_KEY_HISTORY)?;
        let ops = Arc::new(OpsRecorder::new(Box::new(store), sink));

        Ok(Self {
            ledger,
            payer,
            tracked_mint: config.tracked_mint,
            reward_mint: config.reward_mint,
            reward_info,
            submitter,
            fee_claim,
            swap,
            swap_sizing: config.swap_sizing(),
            policy: config.allocation.policy.clone(),
            pool_bps: config.allocation.pool_bps,
            min_pool: config.allocation.min_pool,
            ops,
        })
    }

    /// Claim stage. Returns the claim this cycle's swap is sized from.
    pub async fn claim(&self, cycle: CycleId) -> Result<Option<ClaimResult>> {
        if self.ops.is_recorded(cycle, Stage::Claim)? {
            info!("[cycle {}] Claim already recorded, not claiming again", cycle);
            return Ok(self.ops.state()?.last_claim);
        }
        let Some(service) = &self.fee_claim else {
            debug!("[cycle {}] No fee-claim service", cycle);
            return Ok(None);
        };

        let claim = service.claim(cycle).await?;
        info!("[cycle {}] Claimed {} lamports", cycle, claim.amount_moved);
        if let Err(e) = self.ops.record_claim(cycle, &claim).await {
            warn!("[cycle {}] Failed to record claim: {:#}", cycle, e);
        }
        Ok(Some(claim))
    }

    /// Swap stage, sized from `claim`.
    ///
    /// The signed transaction is persisted as a swap intent before it is
    /// sent. An intent left by an earlier run of the same cycle is resolved
    /// first, so a crash between confirmation and crediting never swaps the
    /// same fees twice.
    pub async fn swap(&self, cycle: CycleId, claim: Option<&ClaimResult>) -> Result<Option<SwapResult>> {
        if self.ops.is_recorded(cycle, Stage::Swap)? {
            info!("[cycle {}] Swap already recorded, not swapping again", cycle);
            return Ok(None);
        }
        let Some(service) = &self.swap else {
            debug!("[cycle {}] No swap service", cycle);
            return Ok(None);
        };

        if let Some(intent) = self.ops.swap_intent(cycle)? {
            info!("[cycle {}] Checking swap {} sent by an earlier run", cycle, intent.signature);
            match service.resume(&intent).await? {
                Some(result) => {
                    self.record_swap(cycle, &result).await;
                    return Ok(Some(result));
                }
                None => self.ops.clear_swap_intent()?,
            }
        }

        let available = self
            .ledger
            .lamports(&self.payer.pubkey())
            .await
            .context("Failed to read native balance")?;
        let lamports_in = self.swap_sizing.amount_to_swap(claim, available);
        if lamports_in == 0 {
            info!(
                "[cycle {}] Nothing to swap (claimed {}, balance {})",
                cycle,
                claim.map_or(0, |c| c.amount_moved),
                available
            );
            return Ok(None);
        }

        let prepared = service.prepare(cycle, lamports_in).await?;
        self.ops
            .begin_swap(prepared.intent.clone())
            .context("Swap not sent, its intent could not be persisted")?;
        let result = service.execute(&prepared).await?;
        self.record_swap(cycle, &result).await;
        Ok(Some(result))
    }

    async fn record_swap(&self, cycle: CycleId, result: &SwapResult) {
        if let Err(e) = self.ops.record_swap(cycle, result).await {
            warn!("[cycle {}] Failed to record swap: {:#}", cycle, e);
        }
    }

    /// Distribution stage: snapshot holders, allocate the pool, submit.
    ///
    /// Undelivered amounts stay in the wallet and roll into the next pool.
    pub async fn distribute(&self, cycle: CycleId) -> Result<Option<DistributionReport>> {
        if self.ops.is_recorded(cycle, Stage::Distribute)? {
            info!("[cycle {}] Airdrop already recorded, not distributing again", cycle);
            return Ok(None);
        }

        let balance = self.reward_balance().await?;
        let pool = pool_from_balance(balance, self.pool_bps);
        if pool == 0 || pool < self.min_pool {
            info!(
                "[cycle {}] Pool {} (balance {}) below minimum {}, skipping airdrop",
                cycle, pool, balance, self.min_pool
            );
            return Ok(None);
        }

        let preview = self.allocate(balance, pool).await?;
        if preview.rows.is_empty() {
            warn!("[cycle {}] No eligible recipients among {} holders", cycle, preview.holders);
            return Ok(None);
        }
        info!(
            "[cycle {}] Distributing {} of {} to {} recipients ({} holders)",
            cycle,
            pool,
            balance,
            preview.rows.len(),
            preview.holders
        );

        let report = self.submitter.submit_all(cycle, preview.rows).await;
        if let Err(e) = self.ops.record_airdrop(cycle, &report.to_airdrop_result()).await {
            error!(
                "[cycle {}] Airdrop of {} delivered but not recorded: {:#}",
                cycle, report.delivered_amount, e
            );
        }
        Ok(Some(report))
    }

    /// Allocation for the current balance, without sending anything
    pub async fn preview(&self) -> Result<Preview> {
        let balance = self.reward_balance().await?;
        self.allocate(balance, pool_from_balance(balance, self.pool_bps)).await
    }

    async fn reward_balance(&self) -> Result<u64> {
        self.ledger
            .token_balance(&self.payer.pubkey(), &self.reward_mint, &self.reward_info)
            .await
            .context("Failed to read reward balance")
    }

    async fn allocate(&self, balance: u64, pool: u64) -> Result<Preview> {
        let holders = self
            .ledger
            .enumerate_holders(&self.tracked_mint)
            .await
            .with_context(|| format!("Failed to enumerate holders of {}", self.tracked_mint))?;
        let rows = self.policy.allocate(pool, &holders);
        debug!(
            "Allocated {} of {} across {} rows",
            total_allocated(&rows),
            pool,
            rows.len()
        );
        Ok(Preview {
            balance,
            pool,
            holders: holders.len(),
            rows,
        })
    }
}

/// Results carried from one stage to the next within a cycle
#[derive(Debug, Default)]
struct CycleContext {
    cycle: CycleId,
    claim: Option<ClaimResult>,
    swap: Option<SwapResult>,
}

enum StageOutcome {
    Claimed(Option<ClaimResult>),
    Swapped(Option<SwapResult>),
    Distributed(Option<DistributionReport>),
}

/// A stage that outlived its timeout and is still running
struct DetachedStage {
    cycle: CycleId,
    stage: Stage,
    handle: JoinHandle<Result<StageOutcome>>,
}

impl DetachedStage {
    /// Log how an abandoned stage ended. Its result is not used.
    async fn finish(self) {
        match self.handle.await {
            Ok(Ok(StageOutcome::Distributed(Some(report)))) => info!(
                "[cycle {}] Abandoned {} finished late: {} delivered to {} recipients, {} failed",
                self.cycle,
                self.stage,
                report.delivered_amount,
                report.delivered_rows,
                report.failed.len()
            ),
            Ok(Ok(_)) => info!("[cycle {}] Abandoned {} finished late", self.cycle, self.stage),
            Ok(Err(e)) => warn!("[cycle {}] Abandoned {} failed: {:#}", self.cycle, self.stage, e),
            Err(e) => error!("[cycle {}] Abandoned {} task aborted: {}", self.cycle, self.stage, e),
        }
    }
}

/// Drives an `Engine` on the cycle grid
pub struct CycleRunner {
    engine: Arc<Engine>,
    tracker: CycleTracker,
    clock: Arc<dyn Clock>,
    timeouts: StageTimeouts,
    poll_interval: Duration,
    context: Option<CycleContext>,
    detached: Vec<DetachedStage>,
}

impl CycleRunner {
    pub fn new(
        engine: Arc<Engine>,
        schedule: CycleSchedule,
        clock: Arc<dyn Clock>,
        timeouts: StageTimeouts,
        poll_interval: Duration,
    ) -> Self {
        Self {
            engine,
            tracker: CycleTracker::new(schedule),
            clock,
            timeouts,
            poll_interval,
            context: None,
            detached: Vec::new(),
        }
    }

    /// Runner on the system clock with configured schedule and timeouts
    pub fn from_config(engine: Arc<Engine>, config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(
            engine,
            config.schedule()?,
            Arc::new(SystemClock),
            config.stage_timeouts().into(),
            Duration::from_millis(config.cycle.poll_interval_ms),
        ))
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn tracker(&self) -> &CycleTracker {
        &self.tracker
    }

    /// Run every stage due now, in order. Returns what was fired.
    pub async fn tick(&mut self) -> Vec<(CycleId, Stage)> {
        let now = self.clock.now_ms();
        let mut fired = Vec::new();
        while let Some((cycle, stage)) = self.tracker.next_due(now) {
            self.execute(cycle, stage).await;
            fired.push((cycle, stage));
        }
        fired
    }

    /// Run all unfired stages of the current cycle immediately
    pub async fn run_once(&mut self) -> Vec<(CycleId, Stage)> {
        let due = self.tracker.force_due(self.clock.now_ms());
        if due.is_empty() {
            info!("All stages of the current cycle already ran");
        }
        for (cycle, stage) in &due {
            self.execute(*cycle, *stage).await;
        }
        due
    }

    /// Collect abandoned stages that have finished since the last look
    async fn reap_detached(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.detached).into_iter().partition(|d| d.handle.is_finished());
        self.detached = running;
        for stage in finished {
            stage.finish().await;
        }
    }

    async fn execute(&mut self, cycle: CycleId, stage: Stage) {
        self.reap_detached().await;
        if moves_reward_balance(stage) {
            if let Some(busy) = self.detached.iter().find(|d| moves_reward_balance(d.stage)) {
                warn!(
                    "[cycle {}] Skipping {}: {} of cycle {} is still running",
                    cycle, stage, busy.stage, busy.cycle
                );
                self.tracker.complete(cycle, stage);
                return;
            }
        }

        if self.context.as_ref().map(|c| c.cycle) != Some(cycle) {
            self.context = Some(CycleContext {
                cycle,
                ..Default::default()
            });
        }
        let claim = self.context.as_ref().and_then(|c| c.claim.clone());
        let limit = self.timeouts.for_stage(stage);
        let engine = self.engine.clone();

        info!("[cycle {}] Starting {}", cycle, stage);
        let started = Instant::now();
        // a timed-out task keeps running detached; its result is only logged
        let mut task = tokio::spawn(async move {
            match stage {
                Stage::Claim => engine.claim(cycle).await.map(StageOutcome::Claimed),
                Stage::Swap => engine.swap(cycle, claim.as_ref()).await.map(StageOutcome::Swapped),
                Stage::Distribute => engine.distribute(cycle).await.map(StageOutcome::Distributed),
            }
        });

        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(Ok(outcome))) => {
                debug!("[cycle {}] {} finished in {:?}", cycle, stage, started.elapsed());
                self.apply(cycle, outcome);
            }
            Ok(Ok(Err(e))) => warn!("[cycle {}] {} failed: {:#}", cycle, stage, e),
            Ok(Err(e)) => error!("[cycle {}] {} task aborted: {}", cycle, stage, e),
            Err(_) => {
                warn!(
                    "[cycle {}] {} timed out after {}s, abandoned for this cycle",
                    cycle,
                    stage,
                    limit.as_secs_f64()
                );
                self.detached.push(DetachedStage {
                    cycle,
                    stage,
                    handle: task,
                });
            }
        }
        self.tracker.complete(cycle, stage);
    }

    fn apply(&mut self, cycle: CycleId, outcome: StageOutcome) {
        let Some(ctx) = self.context.as_mut().filter(|c| c.cycle == cycle) else {
            return;
        };
        match outcome {
            StageOutcome::Claimed(claim) => ctx.claim = claim,
            StageOutcome::Swapped(swap) => ctx.swap = swap,
            StageOutcome::Distributed(Some(report)) => {
                let swapped = ctx.swap.as_ref().map_or(0, |s| s.amount_moved);
                info!(
                    "[cycle {}] Done: {} delivered to {} recipients ({} swapped in), {} dropped, {} failed",
                    cycle,
                    report.delivered_amount,
                    report.delivered_rows,
                    swapped,
                    report.dropped.len(),
                    report.failed.len()
                );
            }
            StageOutcome::Distributed(None) => {}
        }
    }

    /// Run until Ctrl-C (or `shutdown`, if given).
    ///
    /// A stage in progress finishes (bounded by its timeout) before the loop
    /// exits, and stages abandoned after a timeout are awaited. A second
    /// Ctrl-C exits the process immediately.
    pub async fn run(mut self, shutdown: Option<Arc<Notify>>) -> Result<()> {
        let schedule = self.tracker.schedule();
        info!(
            "Distributor started: {}s cycles, stages at +{}s/+{}s/+{}s. Press Ctrl+C to exit.",
            schedule.width().as_secs(),
            schedule.offset_ms(Stage::Claim) / 1000,
            schedule.offset_ms(Stage::Swap) / 1000,
            schedule.offset_ms(Stage::Distribute) / 1000
        );

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let shutdown_notify = Arc::new(Notify::new());
        {
            let flag = shutdown_flag.clone();
            let notify = shutdown_notify.clone();
            tokio::spawn(async move {
                signal::ctrl_c().await.ok();
                warn!("Ctrl-C received, shutting down gracefully...");
                flag.store(true, Ordering::SeqCst);
                notify.notify_one();

                signal::ctrl_c().await.ok();
                warn!("Second Ctrl-C received, forcing immediate shutdown");
                std::process::exit(1);
            });
        }
        if let Some(ext_notify) = shutdown {
            let flag = shutdown_flag.clone();
            let notify = shutdown_notify.clone();
            tokio::spawn(async move {
                ext_notify.notified().await;
                info!("External shutdown signal received");
                flag.store(true, Ordering::SeqCst);
                notify.notify_one();
            });
        }

        // Skip so a long stage does not cause a burst of ticks afterwards
        let mut poll_timer = interval(self.poll_interval);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = poll_timer.tick(), if !shutdown_flag.load(Ordering::Relaxed) => {
                    self.tick().await;
                }

                _ = shutdown_notify.notified() => {
                    break;
                }
            }
        }

        info!("Shutting down...");
        if !self.detached.is_empty() {
            info!("Waiting for {} abandoned stage(s) to finish...", self.detached.len());
            for stage in std::mem::take(&mut self.detached) {
                stage.finish().await;
            }
        }
        match self.engine.ops.state() {
            Ok(state) => info!(
                "Totals: claimed {}, swapped {} -> {}, airdropped {} in {} airdrop(s)",
                state.totals.claimed,
                state.totals.swapped_in,
                state.totals.swapped_out,
                state.totals.airdropped,
                state.totals.airdrops
            ),
            Err(e) => warn!("Failed to read totals: {:#}", e),
        }
        info!("Distributor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::CyclePhase;
    use crate::state::MemoryDedupStore;
    use crate::submitter::SubmitterSettings;
    use crate::swap::PreparedSwap;
    use crate::test_support::{test_settings, ManualClock, MockEndpoint};
    use crate::types::SwapIntent;
    use async_trait::async_trait;
    use chrono::Utc;
    use solana_sdk::program_pack::Pack;
    use solana_sdk::transaction::VersionedTransaction;
    use spl_associated_token_account::get_associated_token_address_with_program_id;
    use spl_token_2022::state::{Account as TokenAccount, AccountState};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const WIDTH_MS: i64 = 60_000;
    // start of cycle 1000
    const T0: i64 = 1000 * WIDTH_MS;

    #[derive(Default)]
    struct FixedClaim {
        amount: u64,
        delay: Duration,
        calls: Mutex<Vec<CycleId>>,
    }

    #[async_trait]
    impl FeeClaimService for FixedClaim {
        async fn claim(&self, cycle: CycleId) -> Result<ClaimResult> {
            self.calls.lock().unwrap().push(cycle);
            tokio::time::sleep(self.delay).await;
            Ok(ClaimResult {
                at: Utc::now(),
                amount_moved: self.amount,
                reference_id: Some(format!("claim-{}", cycle)),
            })
        }
    }

    #[derive(Default)]
    struct FixedSwap {
        out: u64,
        inputs: Mutex<Vec<u64>>,
        /// What `resume` reports for an earlier intent
        landed_before_restart: bool,
        resumed: Mutex<Vec<String>>,
    }

    impl FixedSwap {
        fn result(&self, lamports_in: u64, signature: &str) -> SwapResult {
            SwapResult {
                at: Utc::now(),
                amount_in: lamports_in,
                amount_moved: self.out,
                reference_id: Some(signature.to_string()),
            }
        }
    }

    #[async_trait]
    impl SwapService for FixedSwap {
        async fn prepare(&self, cycle: CycleId, lamports_in: u64) -> Result<PreparedSwap> {
            self.inputs.lock().unwrap().push(lamports_in);
            Ok(PreparedSwap {
                intent: SwapIntent {
                    cycle,
                    signature: format!("swap-{}", cycle),
                    last_valid_block_height: 200,
                    lamports_in,
                    balance_before: 0,
                },
                transaction: VersionedTransaction::default(),
            })
        }

        async fn execute(&self, prepared: &PreparedSwap) -> Result<SwapResult> {
            Ok(self.result(prepared.intent.lamports_in, &prepared.intent.signature))
        }

        async fn resume(&self, intent: &SwapIntent) -> Result<Option<SwapResult>> {
            self.resumed.lock().unwrap().push(intent.signature.clone());
            Ok(self
                .landed_before_restart
                .then(|| self.result(intent.lamports_in, &intent.signature)))
        }
    }

    struct Fixture {
        ep: Arc<MockEndpoint>,
        holders: Vec<Pubkey>,
        claim: Arc<FixedClaim>,
        swap: Arc<FixedSwap>,
        ops: Arc<OpsRecorder>,
        engine: Arc<Engine>,
    }

    fn fixture(reward_balance: u64, claim_delay: Duration) -> Fixture {
        fixture_with_swap(
            reward_balance,
            claim_delay,
            FixedSwap {
                out: reward_balance,
                ..Default::default()
            },
        )
    }

    fn fixture_with_swap(reward_balance: u64, claim_delay: Duration, swap: FixedSwap) -> Fixture {
        let ep = Arc::new(MockEndpoint::new("http://rpc"));
        let payer = Arc::new(Keypair::new());
        let tracked_mint = Pubkey::new_unique();
        let reward_mint = Pubkey::new_unique();
        let reward_info = MintInfo {
            program_id: spl_token::id(),
            decimals: 6,
        };

        let holders: Vec<Pubkey> = (0..3).map(|_| Pubkey::new_unique()).collect();
        for (i, owner) in holders.iter().enumerate() {
            ep.add_token_account(spl_token::id(), tracked_mint, *owner, (i as u64 + 1) * 10);
        }
        // the distributor's own holding is excluded
        ep.add_token_account(spl_token::id(), tracked_mint, payer.pubkey(), 1_000);

        let mut data = vec![0u8; TokenAccount::LEN];
        TokenAccount::pack(
            TokenAccount {
                mint: reward_mint,
                owner: payer.pubkey(),
                amount: reward_balance,
                state: AccountState::Initialized,
                ..Default::default()
            },
            &mut data,
        )
        .unwrap();
        let ata = get_associated_token_address_with_program_id(&payer.pubkey(), &reward_mint, &spl_token::id());
        ep.set_account(ata, spl_token::id(), 2_039_280, data);
        ep.set_account(payer.pubkey(), solana_sdk::system_program::id(), 5_000_000_000, vec![]);

        let ledger = Arc::new(LedgerClient::new(vec![ep.clone() as Arc<dyn LedgerRpc>], test_settings()).unwrap());
        let plan = TransferPlan {
            mint: reward_mint,
            token_program: reward_info.program_id,
            decimals: reward_info.decimals,
            compute_unit_price: 1_000,
            base_compute_units: 5_000,
            compute_units_per_recipient: 30_000,
        };
        let submitter = BatchSubmitter::new(
            ledger.clone(),
            payer.clone(),
            plan,
            SubmitterSettings {
                min_submit_gap: Duration::ZERO,
                retry_base_delay: Duration::ZERO,
                retry_max_delay: Duration::ZERO,
                ..Default::default()
            },
        );

        let claim = Arc::new(FixedClaim {
            amount: 2_000_000_000,
            delay: claim_delay,
            ..Default::default()
        });
        let swap = Arc::new(swap);
        let ops = Arc::new(OpsRecorder::new(Box::new(MemoryDedupStore::default()), None));

        let engine = Arc::new(Engine {
            ledger,
            payer: payer.clone(),
            tracked_mint,
            reward_mint,
            reward_info,
            submitter,
            fee_claim: Some(claim.clone()),
            swap: Some(swap.clone()),
            swap_sizing: SwapSizing {
                share_bps: 5_000,
                min_lamports: 1,
                reserve_lamports: 0,
            },
            policy: AllocationPolicy {
                excluded_wallets: vec![payer.pubkey().to_string()],
                ..Default::default()
            },
            pool_bps: 10_000,
            min_pool: 0,
            ops: ops.clone(),
        });

        Fixture {
            ep,
            holders,
            claim,
            swap,
            ops,
            engine,
        }
    }

    fn timeouts(claim: Duration) -> StageTimeouts {
        StageTimeouts {
            claim,
            swap: Duration::from_secs(5),
            distribute: Duration::from_secs(5),
        }
    }

    fn runner(fx: &Fixture, clock: &Arc<ManualClock>, claim_timeout: Duration) -> CycleRunner {
        runner_with(fx, clock, timeouts(claim_timeout))
    }

    fn runner_with(fx: &Fixture, clock: &Arc<ManualClock>, timeouts: StageTimeouts) -> CycleRunner {
        let schedule = CycleSchedule::new(
            Duration::from_millis(WIDTH_MS as u64),
            Duration::ZERO,
            Duration::from_secs(20),
            Duration::from_secs(40),
        )
        .unwrap();
        CycleRunner::new(
            fx.engine.clone(),
            schedule,
            clock.clone(),
            timeouts,
            Duration::from_millis(10),
        )
    }

    fn expected(fx: &Fixture, amounts: [u64; 3]) -> BTreeMap<Pubkey, u64> {
        fx.holders.iter().copied().zip(amounts).collect()
    }

    #[test]
    fn test_pool_from_balance() {
        assert_eq!(pool_from_balance(1_000, 10_000), 1_000);
        assert_eq!(pool_from_balance(1_000, 2_500), 250);
        assert_eq!(pool_from_balance(u64::MAX, 10_000), u64::MAX);
        assert_eq!(pool_from_balance(999, 20_000), 999);
    }

    #[tokio::test]
    async fn test_stages_fire_at_offsets() {
        let fx = fixture(600, Duration::ZERO);
        let clock = Arc::new(ManualClock::at(T0 + 1_000));
        let mut runner = runner(&fx, &clock, Duration::from_secs(5));
        let id = CycleId(1000);

        assert_eq!(runner.tick().await, vec![(id, Stage::Claim)]);
        assert_eq!(runner.tick().await, vec![]);

        clock.set(T0 + 21_000);
        assert_eq!(runner.tick().await, vec![(id, Stage::Swap)]);
        assert_eq!(*fx.swap.inputs.lock().unwrap(), vec![1_000_000_000]);

        clock.set(T0 + 41_000);
        assert_eq!(runner.tick().await, vec![(id, Stage::Distribute)]);
        // weights 10/20/30 share 600
        assert_eq!(fx.ep.delivered(), expected(&fx, [100, 200, 300]));
        assert_eq!(runner.tracker().phase(), CyclePhase::Cooldown);

        clock.set(T0 + 59_000);
        assert!(runner.tick().await.is_empty());

        let totals = fx.ops.state().unwrap().totals;
        assert_eq!(totals.claimed, 2_000_000_000);
        assert_eq!(totals.swapped_in, 1_000_000_000);
        assert_eq!(totals.airdropped, 600);
        assert_eq!(totals.recipients, 3);
    }

    #[tokio::test]
    async fn test_late_tick_runs_overdue_stages_in_order() {
        let fx = fixture(600, Duration::ZERO);
        let clock = Arc::new(ManualClock::at(T0 + 50_000));
        let mut runner = runner(&fx, &clock, Duration::from_secs(5));

        let fired = runner.tick().await;

        let stages: Vec<Stage> = fired.iter().map(|(_, s)| *s).collect();
        assert_eq!(stages, vec![Stage::Claim, Stage::Swap, Stage::Distribute]);
        // the swap saw this cycle's claim
        assert_eq!(*fx.swap.inputs.lock().unwrap(), vec![1_000_000_000]);
        assert_eq!(fx.ep.batches().len(), 1);

        // next window starts a new cycle
        clock.set(T0 + WIDTH_MS + 1);
        assert_eq!(runner.tick().await, vec![(CycleId(1001), Stage::Claim)]);
    }

    #[tokio::test]
    async fn test_timed_out_stage_does_not_block_the_next() {
        let fx = fixture(600, Duration::from_secs(30));
        let clock = Arc::new(ManualClock::at(T0 + 50_000));
        let mut runner = runner(&fx, &clock, Duration::from_millis(50));

        let started = Instant::now();
        let fired = runner.tick().await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(fired.len(), 3);
        // no claim result, so nothing to swap
        assert!(fx.swap.inputs.lock().unwrap().is_empty());
        assert_eq!(fx.ep.delivered(), expected(&fx, [100, 200, 300]));
        assert_eq!(fx.ops.state().unwrap().totals.claims, 0);
    }

    #[tokio::test]
    async fn test_slow_distribute_is_not_overlapped_by_the_next_cycle() {
        let fx = fixture(600, Duration::ZERO);
        fx.ep.set_send_delay(Duration::from_millis(500));
        let clock = Arc::new(ManualClock::at(T0 + 50_000));
        let mut runner = runner_with(
            &fx,
            &clock,
            StageTimeouts {
                distribute: Duration::from_millis(50),
                ..timeouts(Duration::from_secs(5))
            },
        );

        assert_eq!(runner.tick().await.len(), 3);
        assert!(fx.ep.batches().is_empty());

        // next cycle while the abandoned distribution is still sending
        clock.set(T0 + WIDTH_MS + 50_000);
        assert_eq!(runner.tick().await.len(), 3);
        assert_eq!(fx.claim.calls.lock().unwrap().len(), 2);
        // swap and distribute of cycle 1001 were skipped
        assert_eq!(fx.swap.inputs.lock().unwrap().len(), 1);

        for _ in 0..100 {
            if fx.ops.state().unwrap().totals.airdrops == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fx.ep.send_count(), 1);
        assert_eq!(fx.ep.delivered(), expected(&fx, [100, 200, 300]));
        assert_eq!(fx.ops.state().unwrap().totals.airdrops, 1);
        assert!(!fx.ops.is_recorded(CycleId(1001), Stage::Distribute).unwrap());

        // once it is done the next cycle distributes again
        fx.ep.set_send_delay(Duration::ZERO);
        clock.set(T0 + 2 * WIDTH_MS + 50_000);
        assert_eq!(runner.tick().await.len(), 3);
        assert_eq!(fx.swap.inputs.lock().unwrap().len(), 2);
        for _ in 0..100 {
            if fx.ops.state().unwrap().totals.airdrops == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(fx.ops.is_recorded(CycleId(1002), Stage::Distribute).unwrap());
    }

    fn pending_intent(cycle: u64) -> SwapIntent {
        SwapIntent {
            cycle: CycleId(cycle),
            signature: "sent-before-crash".into(),
            last_valid_block_height: 150,
            lamports_in: 1_000_000_000,
            balance_before: 0,
        }
    }

    #[tokio::test]
    async fn test_swap_sent_before_restart_is_resumed_not_repeated() {
        let fx = fixture_with_swap(
            600,
            Duration::ZERO,
            FixedSwap {
                out: 600,
                landed_before_restart: true,
                ..Default::default()
            },
        );
        let id = CycleId(1000);
        let claim = fx.engine.claim(id).await.unwrap();
        fx.ops.begin_swap(pending_intent(1000)).unwrap();

        let result = fx.engine.swap(id, claim.as_ref()).await.unwrap().unwrap();

        assert_eq!(result.reference_id.as_deref(), Some("sent-before-crash"));
        assert!(fx.swap.inputs.lock().unwrap().is_empty());
        assert_eq!(*fx.swap.resumed.lock().unwrap(), vec!["sent-before-crash"]);
        let state = fx.ops.state().unwrap();
        assert_eq!(state.totals.swaps, 1);
        assert_eq!(state.swap_intent, None);
        assert!(fx.engine.swap(id, claim.as_ref()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_swap_that_never_landed_is_prepared_again() {
        let fx = fixture(600, Duration::ZERO);
        let id = CycleId(1000);
        let claim = fx.engine.claim(id).await.unwrap();
        fx.ops.begin_swap(pending_intent(1000)).unwrap();

        let result = fx.engine.swap(id, claim.as_ref()).await.unwrap().unwrap();

        assert_eq!(result.reference_id.as_deref(), Some("swap-1000"));
        assert_eq!(*fx.swap.inputs.lock().unwrap(), vec![1_000_000_000]);
        assert_eq!(fx.ops.state().unwrap().totals.swaps, 1);
    }

    #[tokio::test]
    async fn test_intent_of_another_cycle_is_ignored() {
        let fx = fixture(600, Duration::ZERO);
        let id = CycleId(1000);
        let claim = fx.engine.claim(id).await.unwrap();
        fx.ops.begin_swap(pending_intent(999)).unwrap();

        fx.engine.swap(id, claim.as_ref()).await.unwrap().unwrap();

        assert!(fx.swap.resumed.lock().unwrap().is_empty());
        assert_eq!(fx.swap.inputs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recorded_stages_not_repeated_after_restart() {
        let fx = fixture(600, Duration::ZERO);
        let id = CycleId(1000);
        fx.engine.claim(id).await.unwrap();
        fx.engine.distribute(id).await.unwrap();
        let sends = fx.ep.send_count();

        // fresh runner, same ops ledger
        let clock = Arc::new(ManualClock::at(T0 + 50_000));
        let mut runner = runner(&fx, &clock, Duration::from_secs(5));
        assert_eq!(runner.tick().await.len(), 3);

        assert_eq!(fx.claim.calls.lock().unwrap().len(), 1);
        assert_eq!(fx.ep.send_count(), sends);
        // the recorded claim still sizes the swap
        assert_eq!(*fx.swap.inputs.lock().unwrap(), vec![1_000_000_000]);
        assert_eq!(fx.ops.state().unwrap().totals.airdrops, 1);
    }

    #[tokio::test]
    async fn test_run_once_ignores_offsets_but_not_cycle_id() {
        let fx = fixture(600, Duration::ZERO);
        let clock = Arc::new(ManualClock::at(T0));
        let mut runner = runner(&fx, &clock, Duration::from_secs(5));

        assert_eq!(runner.run_once().await.len(), 3);
        assert_eq!(fx.ep.delivered(), expected(&fx, [100, 200, 300]));

        assert!(runner.run_once().await.is_empty());
        clock.set(T0 + 45_000);
        assert!(runner.tick().await.is_empty());
        assert_eq!(fx.claim.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_preview_sends_nothing() {
        let fx = fixture(601, Duration::ZERO);

        let preview = fx.engine.preview().await.unwrap();

        assert_eq!(preview.balance, 601);
        assert_eq!(preview.pool, 601);
        assert_eq!(preview.holders, 4);
        assert_eq!(total_allocated(&preview.rows), 601);
        assert_eq!(preview.rows.len(), 3);
        assert_eq!(fx.ep.send_count(), 0);
    }

    #[tokio::test]
    async fn test_small_pool_skips_airdrop() {
        let mut fx = fixture(600, Duration::ZERO);
        Arc::get_mut(&mut fx.engine).unwrap().min_pool = 1_000;

        assert!(fx.engine.distribute(CycleId(7)).await.unwrap().is_none());
        assert_eq!(fx.ep.send_count(), 0);
        assert!(!fx.ops.is_recorded(CycleId(7), Stage::Distribute).unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let fx = fixture(600, Duration::ZERO);
        let clock = Arc::new(ManualClock::at(T0 + 1_000));
        let runner = runner(&fx, &clock, Duration::from_secs(5));
        let stop = Arc::new(Notify::new());
        stop.notify_one();

        tokio::time::timeout(Duration::from_secs(5), runner.run(Some(stop)))
            .await
            .expect("runner did not stop")
            .unwrap();
    }
}
