use near_sdk::FunctionError;
use thiserror::Error;

/// Entry points abort the receipt on failure, so nothing done earlier in the
/// same call is kept. The balance callback logs its failure instead.
#[derive(Debug, Clone, PartialEq, Eq, Error, FunctionError)]
pub enum EscrowError {
    #[error("AlreadyInitialized: escrow has already been initialized")]
    AlreadyInitialized,
    #[error("NotInitialized: escrow has not been initialized")]
    NotInitialized,
    #[error("EscrowAlreadyCompleted: escrow has already been settled or refunded")]
    EscrowAlreadyCompleted,
    #[error("NoAssetsDeposited: no assets are locked in this escrow")]
    NoAssetsDeposited,
    #[error("EscrowNotExpired: the time lock has not elapsed")]
    EscrowNotExpired,
    #[error("NothingToProcess: no new balance to reconcile")]
    NothingToProcess,
    #[error("TransferFailed: {0}")]
    TransferFailed(String),
    #[error("InvalidConfiguration: {0}")]
    InvalidConfiguration(&'static str),
    #[error("BatchTransferUnsupported: transfer one token id per call")]
    BatchTransferUnsupported,
    #[error("TooManyDeposits: at most {0} deposits can be locked")]
    TooManyDeposits(u32),
    #[error("BalanceUnavailable: could not read the token balance of this escrow")]
    BalanceUnavailable,
    #[error("BalanceContested: tokens arrived while the balance was being read, settle again")]
    BalanceContested,
}
