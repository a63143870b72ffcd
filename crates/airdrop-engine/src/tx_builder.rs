//! Batched transfer transactions
//!
//! Layout of one batch transaction:
//!
//! ```text
//! [0] compute unit limit
//! [1] compute unit price
//! [2 + 2k]     create destination account if absent   (recipient k)
//! [2 + 2k + 1] checked transfer                       (recipient k)
//! ```
//!
//! The builder keeps the instruction → recipient mapping so an error naming
//! an instruction index can be traced back to the recipient that caused it.

use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::instruction::Instruction;
use solana_sdk::message::{Message, VersionedMessage};
use solana_sdk::packet::PACKET_DATA_SIZE;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::VersionedTransaction;
use spl_associated_token_account::get_associated_token_address_with_program_id;
use spl_associated_token_account::instruction::create_associated_token_account_idempotent;
use std::str::FromStr;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger_client::BlockReference;

/// Compute units a single transaction may request
pub const MAX_COMPUTE_UNITS: u32 = 1_400_000;

/// Instructions ahead of the first recipient
const PREAMBLE_LEN: usize = 2;

/// What is being sent and how it is priced
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub mint: Pubkey,
    /// Token program owning `mint` (classic or token-2022)
    pub token_program: Pubkey,
    pub decimals: u8,
    /// Priority fee in micro-lamports per compute unit
    pub compute_unit_price: u64,
    pub base_compute_units: u32,
    pub compute_units_per_recipient: u32,
}

impl TransferPlan {
    pub fn compute_unit_limit(&self, recipients: usize) -> u32 {
        let per = self.compute_units_per_recipient as u64 * recipients as u64;
        (self.base_compute_units as u64 + per).min(MAX_COMPUTE_UNITS as u64) as u32
    }
}

/// One validated transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recipient {
    pub wallet: Pubkey,
    pub amount: u64,
}

/// Parse a wallet address, mapping failure to `InvalidRecipient`
pub fn parse_wallet(wallet: &str) -> LedgerResult<Pubkey> {
    Pubkey::from_str(wallet).map_err(|e| LedgerError::InvalidRecipient {
        wallet: wallet.to_string(),
        reason: e.to_string(),
    })
}

/// A signed batch ready for submission
#[derive(Debug, Clone)]
pub struct BuiltBatch {
    pub transaction: VersionedTransaction,
    pub last_valid_block_height: u64,
    /// Serialized size in bytes
    pub size: usize,
}

impl BuiltBatch {
    /// Recipient position (within the batch) that instruction `index` belongs
    /// to; `None` for the preamble.
    pub fn recipient_for_instruction(index: u8) -> Option<usize> {
        (index as usize).checked_sub(PREAMBLE_LEN).map(|i| i / 2)
    }
}

fn recipient_instructions(
    payer: &Pubkey,
    source: &Pubkey,
    plan: &TransferPlan,
    recipient: &Recipient,
) -> LedgerResult<[Instruction; 2]> {
    let destination =
        get_associated_token_address_with_program_id(&recipient.wallet, &plan.mint, &plan.token_program);
    let create = create_associated_token_account_idempotent(
        payer,
        &recipient.wallet,
        &plan.mint,
        &plan.token_program,
    );
    let transfer = spl_token_2022::instruction::transfer_checked(
        &plan.token_program,
        source,
        &plan.mint,
        &destination,
        payer,
        &[],
        recipient.amount,
        plan.decimals,
    )
    .map_err(|e| LedgerError::InvalidRecipient {
        wallet: recipient.wallet.to_string(),
        reason: e.to_string(),
    })?;
    Ok([create, transfer])
}

/// Build and sign one transfer transaction for `recipients`.
///
/// Fails with `Oversize` when the serialized transaction exceeds the packet
/// limit, before anything is sent.
pub fn build_transfer_batch(
    payer: &Keypair,
    plan: &TransferPlan,
    recipients: &[Recipient],
    block: &BlockReference,
) -> LedgerResult<BuiltBatch> {
    let payer_key = payer.pubkey();
    let source = get_associated_token_address_with_program_id(&payer_key, &plan.mint, &plan.token_program);

    let mut instructions = Vec::with_capacity(PREAMBLE_LEN + recipients.len() * 2);
    instructions.push(ComputeBudgetInstruction::set_compute_unit_limit(
        plan.compute_unit_limit(recipients.len()),
    ));
    instructions.push(ComputeBudgetInstruction::set_compute_unit_price(plan.compute_unit_price));
    for recipient in recipients {
        instructions.extend(recipient_instructions(&payer_key, &source, plan, recipient)?);
    }

    let message = Message::new_with_blockhash(&instructions, Some(&payer_key), &block.blockhash);
    let transaction = VersionedTransaction::try_new(VersionedMessage::Legacy(message), &[payer])
        .map_err(|e| LedgerError::Rejected(format!("signing failed: {}", e)))?;

    let size = bincode::serialize(&transaction)
        .map_err(|e| LedgerError::Rejected(format!("serialization failed: {}", e)))?
        .len();
    if size > PACKET_DATA_SIZE {
        return Err(LedgerError::Oversize(format!(
            "{} recipients need {} bytes, limit {}",
            recipients.len(),
            size,
            PACKET_DATA_SIZE
        )));
    }

    Ok(BuiltBatch {
        transaction,
        last_valid_block_height: block.last_valid_block_height,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::hash::Hash;

    fn plan() -> TransferPlan {
        TransferPlan {
            mint: Pubkey::new_unique(),
            token_program: spl_token::id(),
            decimals: 6,
            compute_unit_price: 10_000,
            base_compute_units: 5_000,
            compute_units_per_recipient: 30_000,
        }
    }

    fn recipients(n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|i| Recipient {
                wallet: Pubkey::new_unique(),
                amount: 1_000 + i as u64,
            })
            .collect()
    }

    fn block() -> BlockReference {
        BlockReference {
            blockhash: Hash::new_unique(),
            last_valid_block_height: 500,
        }
    }

    #[test]
    fn test_batch_layout() {
        let payer = Keypair::new();
        let rs = recipients(3);
        let built = build_transfer_batch(&payer, &plan(), &rs, &block()).unwrap();

        let message = &built.transaction.message;
        let keys = message.static_account_keys();
        let instructions = message.instructions();
        assert_eq!(instructions.len(), 2 + 3 * 2);
        assert_eq!(keys[0], payer.pubkey());
        assert_eq!(built.last_valid_block_height, 500);
        assert_eq!(built.transaction.signatures.len(), 1);

        let program_at = |i: usize| keys[instructions[i].program_id_index as usize];
        assert_eq!(program_at(0), solana_sdk::compute_budget::id());
        assert_eq!(program_at(2), spl_associated_token_account::id());
        assert_eq!(program_at(3), spl_token::id());
        // wallet of recipient 1 is the third account of its create instruction
        assert_eq!(keys[instructions[4].accounts[2] as usize], rs[1].wallet);
    }

    #[test]
    fn test_instruction_to_recipient_mapping() {
        assert_eq!(BuiltBatch::recipient_for_instruction(0), None);
        assert_eq!(BuiltBatch::recipient_for_instruction(1), None);
        assert_eq!(BuiltBatch::recipient_for_instruction(2), Some(0));
        assert_eq!(BuiltBatch::recipient_for_instruction(3), Some(0));
        assert_eq!(BuiltBatch::recipient_for_instruction(9), Some(3));
    }

    #[test]
    fn test_default_width_fits_and_large_batch_is_oversize() {
        let payer = Keypair::new();
        let fits = build_transfer_batch(&payer, &plan(), &recipients(8), &block()).unwrap();
        assert!(fits.size <= PACKET_DATA_SIZE);

        let err = build_transfer_batch(&payer, &plan(), &recipients(14), &block()).unwrap_err();
        assert!(matches!(err, LedgerError::Oversize(_)));
    }

    #[test]
    fn test_token_2022_transfers() {
        let payer = Keypair::new();
        let plan = TransferPlan {
            token_program: spl_token_2022::id(),
            ..plan()
        };
        let built = build_transfer_batch(&payer, &plan, &recipients(2), &block()).unwrap();
        let keys = built.transaction.message.static_account_keys();
        let transfer = &built.transaction.message.instructions()[3];
        assert_eq!(keys[transfer.program_id_index as usize], spl_token_2022::id());
    }

    #[test]
    fn test_compute_limit_capped() {
        let p = plan();
        assert_eq!(p.compute_unit_limit(2), 65_000);
        assert_eq!(p.compute_unit_limit(1_000), MAX_COMPUTE_UNITS);
    }

    #[test]
    fn test_parse_wallet() {
        let key = Pubkey::new_unique();
        assert_eq!(parse_wallet(&key.to_string()).unwrap(), key);
        assert!(matches!(
            parse_wallet("not-a-wallet"),
            Err(LedgerError::InvalidRecipient { .. })
        ));
    }
}
