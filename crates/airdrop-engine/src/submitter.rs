//! Batched, self-sizing submission of allocation rows
//!
//! Rows are cut into batches of the current width and sent in waves of up to
//! `wave_concurrency` transactions. Each outcome feeds back into the queue:
//!
//! | outcome                 | effect                                          |
//! |-------------------------|-------------------------------------------------|
//! | confirmed               | rows delivered; width may grow                  |
//! | oversize                | width halves; rows go back to the queue front   |
//! | transient               | same batch retried next round, after backoff    |
//! | one recipient rejected  | that recipient dropped; the rest requeued       |
//! | sender out of funds     | batch and every unsent row failed, stop         |
//! | anything else           | batch failed                                    |
//!
//! Every row ends up in exactly one of delivered, dropped or failed.

use chrono::Utc;
use futures::future::join_all;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use solana_sdk::signature::{Keypair, Signature};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ErrorClass, LedgerError, LedgerResult};
use crate::ledger_client::{backoff_delay, LedgerClient};
use crate::tx_builder::{build_transfer_batch, parse_wallet, BuiltBatch, Recipient, TransferPlan};
use crate::types::{AirdropResult, AllocationRow, CycleId};

#[derive(Debug, Clone)]
pub struct SubmitterSettings {
    pub initial_width: usize,
    pub max_width: usize,
    /// Consecutive successes before the width grows by one
    pub grow_after: u32,
    /// Attempts per batch before its rows are reported failed
    pub max_batch_attempts: u32,
    /// Batches in flight per wave
    pub wave_concurrency: usize,
    /// Minimum gap between two submissions (zero disables pacing)
    pub min_submit_gap: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for SubmitterSettings {
    fn default() -> Self {
        Self {
            initial_width: 8,
            max_width: 9,
            grow_after: 3,
            max_batch_attempts: 5,
            wave_concurrency: 4,
            min_submit_gap: Duration::from_millis(250),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(16),
        }
    }
}

/// Retry bookkeeping of one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub last_error: Option<ErrorClass>,
}

/// Submitter-wide batch width, bounded by `[1, max]`
#[derive(Debug, Clone)]
pub struct AdaptiveWidth {
    current: usize,
    max: usize,
    grow_after: u32,
    streak: u32,
}

impl AdaptiveWidth {
    pub fn new(initial: usize, max: usize, grow_after: u32) -> Self {
        let max = max.max(1);
        Self {
            current: initial.clamp(1, max),
            max,
            grow_after: grow_after.max(1),
            streak: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn on_success(&mut self) {
        self.streak += 1;
        if self.streak >= self.grow_after && self.current < self.max {
            self.current += 1;
            self.streak = 0;
            debug!("Batch width grown to {}", self.current);
        }
    }

    /// A batch of `batch_len` rows was too large
    pub fn on_oversize(&mut self, batch_len: usize) {
        self.streak = 0;
        let halved = (batch_len / 2).max(1);
        if halved < self.current {
            self.current = halved;
            info!("Batch width shrunk to {}", self.current);
        }
    }

    pub fn on_failure(&mut self) {
        self.streak = 0;
    }
}

/// A row with its parsed destination
#[derive(Debug, Clone)]
struct PendingRow {
    row: AllocationRow,
    recipient: Recipient,
}

#[derive(Debug)]
struct SubmissionBatch {
    rows: Vec<PendingRow>,
    retry: RetryState,
}

impl SubmissionBatch {
    fn new(rows: Vec<PendingRow>) -> Self {
        Self {
            rows,
            retry: RetryState::default(),
        }
    }

    fn amount(&self) -> u64 {
        self.rows.iter().map(|r| r.row.amount).sum()
    }
}

/// Outcome of one `submit_all`
#[derive(Debug, Clone, Default)]
pub struct DistributionReport {
    pub delivered_rows: usize,
    pub delivered_amount: u64,
    /// Rows rejected individually, with the reason
    pub dropped: Vec<(AllocationRow, String)>,
    /// Rows whose batch failed permanently, with the reason
    pub failed: Vec<(AllocationRow, String)>,
    pub signatures: Vec<Signature>,
    pub final_width: usize,
    pub rounds: usize,
}

impl DistributionReport {
    pub fn accounted_rows(&self) -> usize {
        self.delivered_rows + self.dropped.len() + self.failed.len()
    }

    pub fn undelivered_amount(&self) -> u64 {
        self.dropped.iter().chain(&self.failed).map(|(r, _)| r.amount).sum()
    }

    pub fn to_airdrop_result(&self) -> AirdropResult {
        AirdropResult {
            at: Utc::now(),
            amount_moved: self.delivered_amount,
            recipients: self.delivered_rows,
            dropped: self.dropped.len(),
            failed: self.failed.len(),
            reference_id: self.signatures.first().map(|s| s.to_string()),
        }
    }
}

pub struct BatchSubmitter {
    ledger: Arc<LedgerClient>,
    payer: Arc<Keypair>,
    plan: TransferPlan,
    settings: SubmitterSettings,
    pacer: Option<DefaultDirectRateLimiter>,
}

impl BatchSubmitter {
    pub fn new(
        ledger: Arc<LedgerClient>,
        payer: Arc<Keypair>,
        plan: TransferPlan,
        settings: SubmitterSettings,
    ) -> Self {
        let pacer = Quota::with_period(settings.min_submit_gap).map(RateLimiter::direct);
        Self {
            ledger,
            payer,
            plan,
            settings,
            pacer,
        }
    }

    pub fn plan(&self) -> &TransferPlan {
        &self.plan
    }

    /// Deliver `rows`, returning what happened to each of them
    pub async fn submit_all(&self, cycle: CycleId, rows: Vec<AllocationRow>) -> DistributionReport {
        let mut report = DistributionReport::default();
        let mut width = AdaptiveWidth::new(
            self.settings.initial_width,
            self.settings.max_width,
            self.settings.grow_after,
        );

        let mut fresh: VecDeque<PendingRow> = VecDeque::with_capacity(rows.len());
        for row in rows {
            if row.amount == 0 {
                report.dropped.push((row, "zero amount".to_string()));
                continue;
            }
            match parse_wallet(&row.wallet) {
                Ok(wallet) => fresh.push_back(PendingRow {
                    recipient: Recipient {
                        wallet,
                        amount: row.amount,
                    },
                    row,
                }),
                Err(e) => {
                    warn!("[cycle {}] Dropping {}: {}", cycle, row.wallet, e);
                    report.dropped.push((row, e.to_string()));
                }
            }
        }
        let total_rows = fresh.len();
        info!(
            "[cycle {}] Submitting {} rows, initial width {}",
            cycle,
            total_rows,
            width.current()
        );

        let mut retries: VecDeque<SubmissionBatch> = VecDeque::new();
        let concurrency = self.settings.wave_concurrency.max(1);

        while !fresh.is_empty() || !retries.is_empty() {
            report.rounds += 1;

            if let Some(attempts) = retries.iter().map(|b| b.retry.attempts).max() {
                let delay = backoff_delay(
                    attempts.saturating_sub(1),
                    self.settings.retry_base_delay,
                    self.settings.retry_max_delay,
                );
                debug!("[cycle {}] Backing off {}ms before retry round", cycle, delay.as_millis());
                tokio::time::sleep(delay).await;
            }

            let mut wave: Vec<SubmissionBatch> = Vec::with_capacity(concurrency);
            while wave.len() < concurrency {
                if let Some(batch) = retries.pop_front() {
                    wave.push(batch);
                } else if !fresh.is_empty() {
                    let n = width.current().min(fresh.len());
                    wave.push(SubmissionBatch::new(fresh.drain(..n).collect()));
                } else {
                    break;
                }
            }

            let outcomes = join_all(wave.iter().map(|b| self.submit_batch(&b.rows))).await;

            // rows returned to the queue front, kept in wave order
            let mut requeue: Vec<PendingRow> = Vec::new();
            let mut exhausted: Option<LedgerError> = None;
            for (mut batch, outcome) in wave.into_iter().zip(outcomes) {
                match outcome {
                    Err(e) if e.is_source_exhausted() => {
                        width.on_failure();
                        fail_rows(&mut report, batch.rows, &e);
                        exhausted.get_or_insert(e);
                    }
                    Ok(signature) => {
                        width.on_success();
                        report.delivered_rows += batch.rows.len();
                        report.delivered_amount += batch.amount();
                        report.signatures.push(signature);
                        debug!(
                            "[cycle {}] Delivered {} rows in {}",
                            cycle,
                            batch.rows.len(),
                            signature
                        );
                    }
                    Err(e) => match e.class() {
                        ErrorClass::Structural => {
                            if batch.rows.len() == 1 {
                                width.on_failure();
                                warn!("[cycle {}] Single transfer is oversize: {}", cycle, e);
                                fail_rows(&mut report, batch.rows, &e);
                            } else {
                                width.on_oversize(batch.rows.len());
                                requeue.extend(batch.rows);
                            }
                        }
                        ErrorClass::Transient => {
                            width.on_failure();
                            batch.retry.attempts += 1;
                            batch.retry.last_error = Some(e.class());
                            if batch.retry.attempts >= self.settings.max_batch_attempts {
                                warn!(
                                    "[cycle {}] Batch of {} rows failed after {} attempts: {}",
                                    cycle,
                                    batch.rows.len(),
                                    batch.retry.attempts,
                                    e
                                );
                                fail_rows(&mut report, batch.rows, &e);
                            } else {
                                debug!(
                                    "[cycle {}] Batch attempt {} failed ({}), will retry",
                                    cycle, batch.retry.attempts, e
                                );
                                retries.push_back(batch);
                            }
                        }
                        ErrorClass::FatalForUnit => {
                            width.on_failure();
                            match culprit(&batch.rows, &e) {
                                Some(idx) => {
                                    let bad = batch.rows.remove(idx);
                                    warn!("[cycle {}] Dropping {}: {}", cycle, bad.row.wallet, e);
                                    report.dropped.push((bad.row, e.to_string()));
                                    requeue.extend(batch.rows);
                                }
                                None => {
                                    warn!(
                                        "[cycle {}] Batch of {} rows failed: {}",
                                        cycle,
                                        batch.rows.len(),
                                        e
                                    );
                                    fail_rows(&mut report, batch.rows, &e);
                                }
                            }
                        }
                    },
                }
            }
            if let Some(e) = exhausted {
                let unsent = requeue.len() + fresh.len() + retries.iter().map(|b| b.rows.len()).sum::<usize>();
                warn!(
                    "[cycle {}] Sender cannot fund transfers ({}), failing {} unsent rows",
                    cycle, e, unsent
                );
                fail_rows(&mut report, requeue, &e);
                fail_rows(&mut report, fresh.drain(..).collect(), &e);
                for batch in retries.drain(..) {
                    fail_rows(&mut report, batch.rows, &e);
                }
                break;
            }
            for row in requeue.into_iter().rev() {
                fresh.push_front(row);
            }
        }

        report.final_width = width.current();
        info!(
            "[cycle {}] Submission done: {} delivered ({} units), {} dropped, {} failed, {} rounds, width {}",
            cycle,
            report.delivered_rows,
            report.delivered_amount,
            report.dropped.len(),
            report.failed.len(),
            report.rounds,
            report.final_width
        );
        report
    }

    async fn submit_batch(&self, rows: &[PendingRow]) -> LedgerResult<Signature> {
        if let Some(pacer) = &self.pacer {
            pacer.until_ready().await;
        }
        let block = self.ledger.latest_block_reference().await?;
        let recipients: Vec<Recipient> = rows.iter().map(|r| r.recipient).collect();
        let built = build_transfer_batch(&self.payer, &self.plan, &recipients, &block)?;
        self.ledger
            .submit_and_confirm(&built.transaction, built.last_valid_block_height)
            .await
    }
}

/// Position of the row an error blames, if it names one
fn culprit(rows: &[PendingRow], err: &LedgerError) -> Option<usize> {
    match err {
        LedgerError::InstructionFailed { index, .. } => {
            BuiltBatch::recipient_for_instruction(*index).filter(|i| *i < rows.len())
        }
        LedgerError::InvalidRecipient { wallet, .. } => rows.iter().position(|r| &r.row.wallet == wallet),
        _ => None,
    }
}

fn fail_rows(report: &mut DistributionReport, rows: Vec<PendingRow>, err: &LedgerError) {
    let reason = err.to_string();
    report
        .failed
        .extend(rows.into_iter().map(|r| (r.row, reason.clone())));
}
