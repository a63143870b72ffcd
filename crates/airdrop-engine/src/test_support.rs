//! In-memory ledger endpoint and clock for unit tests

use async_trait::async_trait;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::cycle::Clock;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger_client::{
    AccountSnapshot, BlockReference, LedgerRpc, LedgerSettings, SignatureState, TokenAccountRecord,
};

/// Ledger settings with no waiting
pub fn test_settings() -> LedgerSettings {
    LedgerSettings {
        max_attempts: 3,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        confirm_poll_interval: Duration::ZERO,
        confirm_timeout: Duration::from_secs(5),
    }
}

/// Manually advanced clock
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn at(ms: i64) -> Self {
        Self(AtomicI64::new(ms))
    }

    pub fn set(&self, ms: i64) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a send should do instead of landing normally
#[derive(Debug, Clone)]
enum SendFault {
    /// Return the error, nothing lands
    Fail(LedgerError),
    /// Land the transaction but report a timeout to the caller
    LandThenTimeout,
    /// Accept the send, never land
    Lose,
}

#[derive(Default)]
struct MockState {
    token_accounts: Vec<(Pubkey, Pubkey, TokenAccountRecord)>,
    accounts: HashMap<Pubkey, AccountSnapshot>,
    read_faults: VecDeque<LedgerError>,
    scanned: Vec<Pubkey>,

    send_faults: VecDeque<SendFault>,
    max_transfers: Option<usize>,
    rejected_wallets: HashSet<Pubkey>,
    landed: HashSet<Signature>,
    batches: Vec<Vec<(Pubkey, u64)>>,
    delivered: BTreeMap<Pubkey, u64>,
    sends: usize,
    send_delay: Duration,
    block_height: u64,
}

/// Scriptable `LedgerRpc`.
///
/// Submission decodes the batch layout produced by `tx_builder`, so tests can
/// assert on who received what. Landing is deduplicated by signature, like a
/// real cluster.
pub struct MockEndpoint {
    url: String,
    state: Mutex<MockState>,
}

impl MockEndpoint {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: Mutex::new(MockState {
                block_height: 100,
                ..Default::default()
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_token_account(&self, program: Pubkey, mint: Pubkey, owner: Pubkey, amount: u64) {
        self.with(|s| s.token_accounts.push((program, mint, TokenAccountRecord { owner, amount })));
    }

    pub fn set_account(&self, address: Pubkey, owner: Pubkey, lamports: u64, data: Vec<u8>) {
        self.with(|s| {
            s.accounts.insert(address, AccountSnapshot { owner, lamports, data });
        });
    }

    /// The next `n` reads fail with `err`
    pub fn fail_reads(&self, n: usize, err: LedgerError) {
        self.with(|s| s.read_faults.extend(std::iter::repeat(err).take(n)));
    }

    /// The next `n` sends fail with `err`
    pub fn fail_sends(&self, n: usize, err: LedgerError) {
        self.with(|s| {
            s.send_faults
                .extend(std::iter::repeat(SendFault::Fail(err)).take(n))
        });
    }

    /// The next send lands but the caller sees a timeout
    pub fn land_then_timeout(&self) {
        self.with(|s| s.send_faults.push_back(SendFault::LandThenTimeout));
    }

    /// The next send is accepted and never lands
    pub fn lose_next_send(&self) {
        self.with(|s| s.send_faults.push_back(SendFault::Lose));
    }

    /// Reject transactions carrying more than `n` transfers as too large
    pub fn set_max_transfers(&self, n: usize) {
        self.with(|s| s.max_transfers = Some(n));
    }

    /// Every send takes `delay` before it is processed
    pub fn set_send_delay(&self, delay: Duration) {
        self.with(|s| s.send_delay = delay);
    }

    /// Fail the create-account instruction of this wallet
    pub fn reject_wallet(&self, wallet: Pubkey) {
        self.with(|s| {
            s.rejected_wallets.insert(wallet);
        });
    }

    /// Mints passed to `token_accounts`, in call order
    pub fn scanned_mints(&self) -> Vec<Pubkey> {
        self.with(|s| s.scanned.clone())
    }

    /// Landed batches as (wallet, amount) lists
    pub fn batches(&self) -> Vec<Vec<(Pubkey, u64)>> {
        self.with(|s| s.batches.clone())
    }

    pub fn delivered(&self) -> BTreeMap<Pubkey, u64> {
        self.with(|s| s.delivered.clone())
    }

    pub fn send_count(&self) -> usize {
        self.with(|s| s.sends)
    }

    fn next_read_fault(&self) -> LedgerResult<()> {
        self.with(|s| s.read_faults.pop_front().map_or(Ok(()), Err))
    }
}

/// (instruction index, wallet, amount) for each recipient in a batch
fn decode_transfers(tx: &VersionedTransaction) -> Vec<(u8, Pubkey, u64)> {
    let keys = tx.message.static_account_keys();
    let mut out = Vec::new();
    let mut pending: Option<(u8, Pubkey)> = None;
    for (i, ix) in tx.message.instructions().iter().enumerate() {
        let program = keys[ix.program_id_index as usize];
        if program == spl_associated_token_account::id() {
            pending = Some((i as u8, keys[ix.accounts[2] as usize]));
        } else if program == spl_token::id() || program == spl_token_2022::id() {
            // TransferChecked: tag 12, amount u64 LE, decimals
            if let Some((create_idx, wallet)) = pending.take() {
                let mut amount = [0u8; 8];
                amount.copy_from_slice(&ix.data[1..9]);
                out.push((create_idx, wallet, u64::from_le_bytes(amount)));
            }
        }
    }
    out
}

#[async_trait]
impl LedgerRpc for MockEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    async fn token_accounts(
        &self,
        token_program: &Pubkey,
        mint: &Pubkey,
    ) -> LedgerResult<Vec<TokenAccountRecord>> {
        self.with(|s| s.scanned.push(*mint));
        self.next_read_fault()?;
        Ok(self.with(|s| {
            s.token_accounts
                .iter()
                .filter(|(p, m, _)| p == token_program && m == mint)
                .map(|(_, _, r)| *r)
                .collect()
        }))
    }

    async fn account(&self, address: &Pubkey) -> LedgerResult<Option<AccountSnapshot>> {
        self.next_read_fault()?;
        Ok(self.with(|s| s.accounts.get(address).cloned()))
    }

    async fn latest_block_reference(&self) -> LedgerResult<BlockReference> {
        Ok(self.with(|s| BlockReference {
            blockhash: Hash::new_unique(),
            last_valid_block_height: s.block_height + 10,
        }))
    }

    async fn block_height(&self) -> LedgerResult<u64> {
        // time passes between polls
        Ok(self.with(|s| {
            s.block_height += 5;
            s.block_height
        }))
    }

    async fn send_transaction(&self, tx: &VersionedTransaction) -> LedgerResult<Signature> {
        let signature = tx.signatures[0];
        let transfers = decode_transfers(tx);
        let delay = self.with(|s| s.send_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            s.sends += 1;

            if s.landed.contains(&signature) {
                return Ok(signature);
            }
            let fault = s.send_faults.pop_front();
            if let Some(SendFault::Fail(e)) = fault {
                return Err(e);
            }
            if let Some(max) = s.max_transfers {
                if transfers.len() > max {
                    return Err(LedgerError::Oversize(format!("{} transfers", transfers.len())));
                }
            }
            if let Some((idx, wallet, _)) =
                transfers.iter().find(|(_, w, _)| s.rejected_wallets.contains(w))
            {
                return Err(LedgerError::InstructionFailed {
                    index: *idx,
                    reason: format!("invalid account data for {}", wallet),
                });
            }
            if matches!(fault, Some(SendFault::Lose)) {
                return Ok(signature);
            }

            s.landed.insert(signature);
            for (_, wallet, amount) in &transfers {
                *s.delivered.entry(*wallet).or_insert(0) += amount;
            }
            s.batches
                .push(transfers.iter().map(|(_, w, a)| (*w, *a)).collect());

            match fault {
                Some(SendFault::LandThenTimeout) => Err(LedgerError::Timeout("send".into())),
                _ => Ok(signature),
            }
        })
    }

    async fn signature_state(&self, signature: &Signature) -> LedgerResult<SignatureState> {
        Ok(self.with(|s| {
            if s.landed.contains(signature) {
                SignatureState::Confirmed
            } else {
                SignatureState::Pending
            }
        }))
    }
}
