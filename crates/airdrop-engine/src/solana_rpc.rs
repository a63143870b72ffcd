//! Solana JSON-RPC endpoint
//!
//! `LedgerRpc` over `solana-client`'s nonblocking `RpcClient`. This is the
//! only place that looks inside provider errors.

use async_trait::async_trait;
use solana_account_decoder::UiAccountEncoding;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig, RpcSendTransactionConfig};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_client::rpc_request::RpcError;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::instruction::InstructionError;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::{TransactionError, VersionedTransaction};
use spl_token_2022::extension::StateWithExtensions;
use spl_token_2022::state::Account as TokenAccount;
use std::time::Duration;
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger_client::{AccountSnapshot, BlockReference, LedgerRpc, SignatureState, TokenAccountRecord};

/// Size of a classic token account
const TOKEN_ACCOUNT_LEN: u64 = 165;

/// Offset of the mint field in a token account
const MINT_OFFSET: usize = 0;

// JSON-RPC server error codes
const NODE_UNHEALTHY: i64 = -32005;
const BLOCK_NOT_AVAILABLE: i64 = -32004;
const BLOCK_STATUS_NOT_AVAILABLE_YET: i64 = -32014;
const MIN_CONTEXT_SLOT_NOT_REACHED: i64 = -32016;
const RATE_LIMITED: i64 = 429;

pub struct SolanaEndpoint {
    url: String,
    client: RpcClient,
    commitment: CommitmentConfig,
}

impl SolanaEndpoint {
    pub fn new(url: &str, request_timeout: Duration, commitment: CommitmentConfig) -> Self {
        Self {
            url: url.to_string(),
            client: RpcClient::new_with_timeout_and_commitment(url.to_string(), request_timeout, commitment),
            commitment,
        }
    }
}

/// Custom error 1 is `InsufficientFunds` in the token programs and
/// `ResultWithNegativeLamports` in the system program
const CUSTOM_INSUFFICIENT_FUNDS: u32 = 1;

/// Map a transaction-level failure
pub fn map_transaction_error(err: TransactionError) -> LedgerError {
    match err {
        TransactionError::BlockhashNotFound => LedgerError::BlockhashExpired,
        TransactionError::InsufficientFundsForFee | TransactionError::InsufficientFundsForRent { .. } => {
            LedgerError::InsufficientFunds(err.to_string())
        }
        TransactionError::InstructionError(index, InstructionError::InsufficientFunds)
        | TransactionError::InstructionError(index, InstructionError::Custom(CUSTOM_INSUFFICIENT_FUNDS)) => {
            LedgerError::InsufficientFunds(format!("instruction {}", index))
        }
        TransactionError::InstructionError(index, reason) => LedgerError::InstructionFailed {
            index,
            reason: reason.to_string(),
        },
        TransactionError::TooManyAccountLocks => LedgerError::Oversize(err.to_string()),
        TransactionError::AccountInUse
        | TransactionError::WouldExceedMaxBlockCostLimit
        | TransactionError::WouldExceedMaxAccountCostLimit => LedgerError::Unhealthy(err.to_string()),
        other => LedgerError::Rejected(other.to_string()),
    }
}

/// Map a `solana-client` failure
pub fn map_client_error(err: ClientError) -> LedgerError {
    if let Some(tx_err) = err.get_transaction_error() {
        return map_transaction_error(tx_err);
    }

    match err.kind() {
        ClientErrorKind::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => LedgerError::Timeout(e.to_string()),
        ClientErrorKind::Io(e) => LedgerError::Connection(e.to_string()),
        ClientErrorKind::Reqwest(e) => {
            let status = e.status().map(|s| s.as_u16());
            if e.is_timeout() {
                LedgerError::Timeout(e.to_string())
            } else if status == Some(429) {
                LedgerError::RateLimited(e.to_string())
            } else if status.map_or(false, |s| s >= 500) {
                LedgerError::Unhealthy(e.to_string())
            } else {
                LedgerError::Connection(e.to_string())
            }
        }
        ClientErrorKind::RpcError(RpcError::RpcResponseError { code, message, .. }) => match *code {
            RATE_LIMITED => LedgerError::RateLimited(message.clone()),
            NODE_UNHEALTHY | BLOCK_NOT_AVAILABLE | BLOCK_STATUS_NOT_AVAILABLE_YET | MIN_CONTEXT_SLOT_NOT_REACHED => {
                LedgerError::Unhealthy(message.clone())
            }
            _ if message.contains("too large") => LedgerError::Oversize(message.clone()),
            _ => LedgerError::Rejected(format!("{} ({})", message, code)),
        },
        ClientErrorKind::RpcError(RpcError::RpcRequestError(message)) => {
            if message.contains("429") {
                LedgerError::RateLimited(message.clone())
            } else {
                LedgerError::Connection(message.clone())
            }
        }
        ClientErrorKind::RpcError(other) => LedgerError::InvalidResponse(other.to_string()),
        ClientErrorKind::SerdeJson(e) => LedgerError::InvalidResponse(e.to_string()),
        _ => LedgerError::Rejected(err.to_string()),
    }
}

#[async_trait]
impl LedgerRpc for SolanaEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    async fn token_accounts(
        &self,
        token_program: &Pubkey,
        mint: &Pubkey,
    ) -> LedgerResult<Vec<TokenAccountRecord>> {
        let mut filters = vec![RpcFilterType::Memcmp(Memcmp::new_base58_encoded(
            MINT_OFFSET,
            mint.as_ref(),
        ))];
        // token-2022 accounts carry extensions after the base layout
        if *token_program == spl_token::id() {
            filters.push(RpcFilterType::DataSize(TOKEN_ACCOUNT_LEN));
        }

        let config = RpcProgramAccountsConfig {
            filters: Some(filters),
            account_config: RpcAccountInfoConfig {
                encoding: Some(UiAccountEncoding::Base64),
                commitment: Some(self.commitment),
                ..Default::default()
            },
            ..Default::default()
        };

        let accounts = self
            .client
            .get_program_accounts_with_config(token_program, config)
            .await
            .map_err(map_client_error)?;

        let mut records = Vec::with_capacity(accounts.len());
        for (address, account) in accounts {
            match StateWithExtensions::<TokenAccount>::unpack(&account.data) {
                Ok(state) => records.push(TokenAccountRecord {
                    owner: state.base.owner,
                    amount: state.base.amount,
                }),
                Err(e) => debug!("Skipping unparsable token account {}: {}", address, e),
            }
        }
        Ok(records)
    }

    async fn account(&self, address: &Pubkey) -> LedgerResult<Option<AccountSnapshot>> {
        let response = self
            .client
            .get_account_with_commitment(address, self.commitment)
            .await
            .map_err(map_client_error)?;
        Ok(response.value.map(|account| AccountSnapshot {
            owner: account.owner,
            lamports: account.lamports,
            data: account.data,
        }))
    }

    async fn latest_block_reference(&self) -> LedgerResult<BlockReference> {
        let (blockhash, last_valid_block_height) = self
            .client
            .get_latest_blockhash_with_commitment(self.commitment)
            .await
            .map_err(map_client_error)?;
        Ok(BlockReference {
            blockhash,
            last_valid_block_height,
        })
    }

    async fn block_height(&self) -> LedgerResult<u64> {
        self.client
            .get_block_height_with_commitment(self.commitment)
            .await
            .map_err(map_client_error)
    }

    async fn send_transaction(&self, tx: &VersionedTransaction) -> LedgerResult<Signature> {
        let config = RpcSendTransactionConfig {
            skip_preflight: false,
            preflight_commitment: Some(self.commitment.commitment),
            ..Default::default()
        };
        self.client
            .send_transaction_with_config(tx, config)
            .await
            .map_err(map_client_error)
    }

    async fn signature_state(&self, signature: &Signature) -> LedgerResult<SignatureState> {
        let response = self
            .client
            .get_signature_statuses(&[*signature])
            .await
            .map_err(map_client_error)?;

        let Some(Some(status)) = response.value.into_iter().next() else {
            return Ok(SignatureState::Pending);
        };
        if let Some(err) = status.err.clone() {
            return Ok(SignatureState::Failed(map_transaction_error(err)));
        }
        if status.satisfies_commitment(self.commitment) {
            Ok(SignatureState::Confirmed)
        } else {
            Ok(SignatureState::Pending)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use solana_client::rpc_request::RpcResponseErrorData;

    fn response_error(code: i64, message: &str) -> ClientError {
        ClientError::from(ClientErrorKind::RpcError(RpcError::RpcResponseError {
            code,
            message: message.to_string(),
            data: RpcResponseErrorData::Empty,
        }))
    }

    #[test]
    fn test_transaction_errors() {
        assert!(matches!(
            map_transaction_error(TransactionError::BlockhashNotFound),
            LedgerError::BlockhashExpired
        ));
        assert!(matches!(
            map_transaction_error(TransactionError::InstructionError(5, InstructionError::InvalidAccountData)),
            LedgerError::InstructionFailed { index: 5, .. }
        ));
        assert_eq!(
            map_transaction_error(TransactionError::TooManyAccountLocks).class(),
            ErrorClass::Structural
        );
        assert!(matches!(
            map_transaction_error(TransactionError::InsufficientFundsForFee),
            LedgerError::InsufficientFunds(_)
        ));
        // transfer_checked out of an underfunded reward account
        assert!(matches!(
            map_transaction_error(TransactionError::InstructionError(3, InstructionError::Custom(1))),
            LedgerError::InsufficientFunds(_)
        ));
        assert!(matches!(
            map_transaction_error(TransactionError::InstructionError(3, InstructionError::Custom(4))),
            LedgerError::InstructionFailed { index: 3, .. }
        ));
    }

    #[test]
    fn test_rpc_response_codes() {
        assert!(matches!(map_client_error(response_error(429, "slow down")), LedgerError::RateLimited(_)));
        assert!(matches!(
            map_client_error(response_error(NODE_UNHEALTHY, "Node is behind")),
            LedgerError::Unhealthy(_)
        ));
        assert!(matches!(
            map_client_error(response_error(
                -32602,
                "base64 encoded VersionedTransaction too large: 1644 bytes (max: encoded/raw 1644/1232)"
            )),
            LedgerError::Oversize(_)
        ));
        assert!(matches!(
            map_client_error(response_error(-32003, "signature verification failure")),
            LedgerError::Rejected(_)
        ));
    }

    #[test]
    fn test_transport_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        assert!(matches!(map_client_error(ClientError::from(io)), LedgerError::Timeout(_)));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(map_client_error(ClientError::from(refused)).is_transient());

        let request = ClientErrorKind::RpcError(RpcError::RpcRequestError("HTTP 429 Too Many Requests".into()));
        assert!(matches!(map_client_error(ClientError::from(request)), LedgerError::RateLimited(_)));
    }

    #[test]
    fn test_wrapped_transaction_error_wins() {
        let err = ClientError::from(TransactionError::InstructionError(2, InstructionError::Custom(1)));
        assert!(matches!(map_client_error(err), LedgerError::InstructionFailed { index: 2, .. }));
    }
}
