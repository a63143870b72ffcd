//! Ledger error taxonomy
//!
//! Provider failures are mapped into `LedgerError` once, at the adapter
//! boundary (`solana_rpc.rs`). Everything above the adapter decides what to
//! do by matching on `ErrorClass`, never by inspecting message text.

use thiserror::Error;

/// How a failure should be handled by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry after backoff, rotating to another endpoint
    Transient,
    /// Transaction too large: shrink the batch and requeue its rows
    Structural,
    /// Drop the offending unit (recipient or batch) and continue
    FatalForUnit,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Structural => write!(f, "structural"),
            ErrorClass::FatalForUnit => write!(f, "fatal-for-unit"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("block reference expired before confirmation")]
    BlockhashExpired,

    #[error("endpoint unhealthy: {0}")]
    Unhealthy(String),

    #[error("transaction exceeds size limit: {0}")]
    Oversize(String),

    /// A single instruction was rejected; `index` is its position in the
    /// submitted message.
    #[error("instruction {index} rejected: {reason}")]
    InstructionFailed { index: u8, reason: String },

    #[error("invalid recipient {wallet}: {reason}")]
    InvalidRecipient { wallet: String, reason: String },

    /// The funding source (reward account or fee payer) cannot cover the
    /// transaction. Every later unit funded by the same source fails too.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// Sent, but neither confirmation nor expiry of its block reference could
    /// be observed. Resending could credit twice, so the unit is given up.
    #[error("transaction {0} unconfirmed")]
    Unconfirmed(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::RateLimited(_)
            | LedgerError::Timeout(_)
            | LedgerError::Connection(_)
            | LedgerError::BlockhashExpired
            | LedgerError::Unhealthy(_) => ErrorClass::Transient,
            LedgerError::Oversize(_) => ErrorClass::Structural,
            LedgerError::InstructionFailed { .. }
            | LedgerError::InvalidRecipient { .. }
            | LedgerError::InsufficientFunds(_)
            | LedgerError::Rejected(_)
            | LedgerError::Unconfirmed(_)
            | LedgerError::InvalidResponse(_) => ErrorClass::FatalForUnit,
        }
    }

    /// Whether the failure is about the sender, not the unit being sent
    pub fn is_source_exhausted(&self) -> bool {
        matches!(self, LedgerError::InsufficientFunds(_))
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether repeating the same RPC call (possibly on another endpoint)
    /// can help. An expired block reference needs a rebuilt transaction,
    /// not a repeated call.
    pub fn is_retryable_call(&self) -> bool {
        self.is_transient() && !matches!(self, LedgerError::BlockhashExpired)
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(LedgerError::RateLimited("429".into()).class(), ErrorClass::Transient);
        assert_eq!(LedgerError::BlockhashExpired.class(), ErrorClass::Transient);
        assert_eq!(
            LedgerError::Oversize("1300 > 1232 bytes".into()).class(),
            ErrorClass::Structural
        );
        assert!(!LedgerError::BlockhashExpired.is_retryable_call());
        assert!(LedgerError::Timeout("rpc".into()).is_retryable_call());
        assert_eq!(LedgerError::Unconfirmed("sig".into()).class(), ErrorClass::FatalForUnit);
        assert_eq!(
            LedgerError::InstructionFailed { index: 3, reason: "x".into() }.class(),
            ErrorClass::FatalForUnit
        );
        assert!(!LedgerError::Rejected("blocked".into()).is_transient());
        let exhausted = LedgerError::InsufficientFunds("reward account".into());
        assert_eq!(exhausted.class(), ErrorClass::FatalForUnit);
        assert!(exhausted.is_source_exhausted());
        assert!(!LedgerError::InvalidResponse("x".into()).is_source_exhausted());
    }
}
