//! Error types for NMX engine operations
//!
//! Every rejection is a named, human-readable reason. The `Display` output of each
//! variant is the exact reason string callers match on.

use crate::types::{Address, Amount};
use thiserror::Error;

/// Result type alias for NMX operations
pub type Result<T> = std::result::Result<T, NmxError>;

/// Errors that can occur while driving the emission and staking engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NmxError {
    // === Validation ===
    /// Negative or otherwise malformed amount
    #[error("INVALID_ARGUMENT")]
    InvalidArgument,

    /// Output rate below zero
    #[error("outputRate must be ge 0")]
    OutputRateNegative,

    /// Output rate above one
    #[error("outputRate must be le 1<<64")]
    OutputRateTooLarge,

    /// Pool rate outside [0, 1] or pool rates summing above one
    #[error("invalid pool rates: {0}")]
    InvalidPoolRates(String),

    /// Unknown mint pool id
    #[error("invalid pool id: {0}")]
    InvalidPool(u8),

    /// Share table arrays of different length
    #[error("addresses must be the same length as shares")]
    SharesLengthMismatch,

    /// Zero or negative share
    #[error("shares must be positive")]
    ShareNotPositive,

    /// Single share above one
    #[error("shares must be le 1<<64")]
    ShareTooLarge,

    /// Shares summing above one
    #[error("shares must be le 1<<64 in total")]
    SharesTotalTooLarge,

    /// Bonus table thresholds not strictly increasing
    #[error("INVALID_ORDER")]
    InvalidOrder,

    /// Decimal fraction could not be parsed
    #[error("invalid decimal: {0}")]
    InvalidDecimal(String),

    // === State ===
    /// Unstake above the staked principal
    #[error("NOT_ENOUGH_STAKED")]
    NotEnoughStaked,

    /// Claim above the accrued reward
    #[error("NOT_ENOUGH_BALANCE")]
    NotEnoughBalance,

    /// Staking is paused
    #[error("Pausable: paused")]
    Paused,

    /// Staking is not paused
    #[error("Pausable: not paused")]
    NotPaused,

    /// Claiming is paused
    #[error("CLAIM_REWARD_PAUSED")]
    ClaimRewardPaused,

    /// Zero, self or repeated referrer
    #[error("INVALID_REFERRER")]
    InvalidReferrer,

    /// Pool ownership handed to its current owner
    #[error("new owner must differs from the old one")]
    SamePoolOwner,

    /// Pool ownership handed to an address that owns another pool
    #[error("every pool must have dedicated owner")]
    PoolOwnerNotDedicated,

    /// Recovery above the surplus
    #[error("RECOVERABLE_AMOUNT_NOT_ENOUGH")]
    RecoverableAmountNotEnough,

    /// Recovery of a token that is owed to users in full
    #[error("INVALID_RECOVERABLE_TOKEN")]
    InvalidRecoverableToken,

    /// Operation timestamp earlier than the last applied one
    #[error("TIME_WENT_BACKWARDS: {now} < {last}")]
    TimeWentBackwards { now: u64, last: u64 },

    /// Address not registered with the protocol
    #[error("unknown contract: {0}")]
    UnknownContract(Address),

    // === Authorization ===
    /// Caller is not the single privileged principal
    #[error("caller is not the owner")]
    PermissionDenied,

    /// Caller may not transfer the pool
    #[error("only owner can transfer pool ownership")]
    PoolPermissionDenied,

    /// Signed deadline already passed
    #[error("EXPIRED")]
    Expired,

    /// Signer mismatch, nonce mismatch or malformed signature
    #[error("INVALID_SIGNATURE")]
    InvalidSignature,

    /// Signed unstake amount below the requested amount
    #[error("INVALID_AMOUNT")]
    InvalidAmount,

    /// Signed claim amount below the requested amount
    #[error("INVALID_NMX_AMOUNT")]
    InvalidNmxAmount,

    /// Ownership handed to the zero address
    #[error("new owner is the zero address")]
    ZeroOwner,

    // === Ledger ===
    /// Transfer above the holder's balance
    #[error("transfer amount exceeds balance")]
    InsufficientBalance { available: Amount, requested: Amount },

    /// Transfer above the spender's allowance
    #[error("transfer amount exceeds allowance")]
    InsufficientAllowance { available: Amount, requested: Amount },

    // === Arithmetic ===
    /// Checked fixed-point or integer arithmetic overflowed
    #[error("arithmetic overflow")]
    ArithmeticOverflow,

    /// Division by zero in fixed-point math
    #[error("division by zero")]
    DivisionByZero,
}

/// Error categories
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller mistake
    Validation,
    /// Operation conflicts with current state
    State,
    /// Caller or signature not allowed
    Authorization,
    /// Propagated from the ledger collaborator
    Resource,
}

impl NmxError {
    /// Stable numeric code for the rejection
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidArgument => 1001,
            Self::OutputRateNegative | Self::OutputRateTooLarge => 1002,
            Self::InvalidPoolRates(_) | Self::InvalidPool(_) => 1003,
            Self::SharesLengthMismatch
            | Self::ShareNotPositive
            | Self::ShareTooLarge
            | Self::SharesTotalTooLarge => 1004,
            Self::InvalidOrder => 1005,
            Self::InvalidDecimal(_) => 1006,
            Self::NotEnoughStaked => 2001,
            Self::NotEnoughBalance => 2002,
            Self::Paused | Self::NotPaused => 2003,
            Self::ClaimRewardPaused => 2004,
            Self::InvalidReferrer => 2005,
            Self::SamePoolOwner | Self::PoolOwnerNotDedicated => 2006,
            Self::RecoverableAmountNotEnough | Self::InvalidRecoverableToken => 2007,
            Self::TimeWentBackwards { .. } => 2008,
            Self::UnknownContract(_) => 2009,
            Self::PermissionDenied | Self::PoolPermissionDenied | Self::ZeroOwner => 3001,
            Self::Expired => 3002,
            Self::InvalidSignature => 3003,
            Self::InvalidAmount | Self::InvalidNmxAmount => 3004,
            Self::InsufficientBalance { .. } => 4001,
            Self::InsufficientAllowance { .. } => 4002,
            Self::ArithmeticOverflow | Self::DivisionByZero => 5001,
        }
    }

    /// Category of the rejection
    pub fn category(&self) -> ErrorCategory {
        match self.code() {
            2000..=2999 => ErrorCategory::State,
            3000..=3999 => ErrorCategory::Authorization,
            4000..=4999 => ErrorCategory::Resource,
            _ => ErrorCategory::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(NmxError::NotEnoughStaked.code(), 2001);
        assert_eq!(NmxError::InvalidSignature.code(), 3003);
        assert_eq!(NmxError::ShareNotPositive.code(), NmxError::SharesTotalTooLarge.code());
    }

    #[test]
    fn test_error_display_keeps_reason() {
        assert_eq!(NmxError::OutputRateTooLarge.to_string(), "outputRate must be le 1<<64");
        assert_eq!(NmxError::Paused.to_string(), "Pausable: paused");
        let err = NmxError::InsufficientBalance {
            available: 1,
            requested: 2,
        };
        assert_eq!(err.to_string(), "transfer amount exceeds balance");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(NmxError::InvalidOrder.category(), ErrorCategory::Validation);
        assert_eq!(NmxError::InvalidReferrer.category(), ErrorCategory::State);
        assert_eq!(NmxError::Expired.category(), ErrorCategory::Authorization);
        assert_eq!(
            NmxError::InsufficientAllowance {
                available: 0,
                requested: 1
            }
            .category(),
            ErrorCategory::Resource
        );
        assert_eq!(NmxError::ArithmeticOverflow.category(), ErrorCategory::Validation);
    }
}
