//! Error types for the fibercoin ledger

use crate::blockchain::Sha256Hash;
use thiserror::Error;

/// Broad category of a failure, used by callers to decide how to react.
///
/// Structural and policy failures are the submitter's problem. Consistency
/// failures may succeed later against fresher state, but the core never
/// retries them on its own. Integrity failures mean the block or transaction
/// must be discarded and the event surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Structural,
    Policy,
    Consistency,
    Integrity,
    Internal,
}

/// Reason a single transaction was rejected by the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("transaction has no inputs")]
    NoInputs,

    #[error("transaction has no outputs")]
    NoOutputs,

    #[error("transaction has {signatures} signatures for {inputs} inputs")]
    SignatureCountMismatch { inputs: usize, signatures: usize },

    #[error("duplicate input {}", hex::encode(.0))]
    DuplicateInput(Sha256Hash),

    #[error("output {0} has zero coins")]
    ZeroCoinOutput(usize),

    #[error("output {0} duplicates an earlier output")]
    DuplicateOutput(usize),

    #[error("transaction too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("{0} overflow")]
    Overflow(&'static str),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("unknown input {}", hex::encode(.0))]
    UnknownInput(Sha256Hash),

    #[error("invalid signature for input {0}")]
    InvalidSignature(usize),

    #[error("input {index} is owned by locked distribution address {address}")]
    LockedBalance { index: usize, address: String },

    #[error("insufficient coins: inputs hold {inputs}, outputs spend {outputs}")]
    InsufficientCoins { inputs: u64, outputs: u64 },

    #[error("insufficient coin hours: inputs hold {inputs}, outputs spend {outputs}, {required_burn} must be burned")]
    InsufficientCoinHours {
        inputs: u64,
        outputs: u64,
        required_burn: u64,
    },

    #[error("output {index} coins {coins} exceed {max_decimals} decimal places")]
    InvalidPrecision {
        index: usize,
        coins: u64,
        max_decimals: u8,
    },
}

impl VerificationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            VerificationError::UnknownInput(_) => ErrorClass::Consistency,
            VerificationError::InvalidSignature(_) => ErrorClass::Integrity,
            VerificationError::LockedBalance { .. }
            | VerificationError::InsufficientCoins { .. }
            | VerificationError::InsufficientCoinHours { .. }
            | VerificationError::InvalidPrecision { .. } => ErrorClass::Policy,
            _ => ErrorClass::Structural,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("Transaction verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("Unauthorized block: {0}")]
    UnauthorizedBlock(String),

    #[error("Chain discontinuity: {0}")]
    ChainDiscontinuity(String),

    #[error("Block time {block} is not after head time {head}")]
    NonMonotonicTimestamp { head: u64, block: u64 },

    #[error("Body hash mismatch: header commits to {}, transactions hash to {}", hex::encode(.expected), hex::encode(.actual))]
    BodyHashMismatch {
        expected: Sha256Hash,
        actual: Sha256Hash,
    },

    #[error("Block fee mismatch: header declares {declared}, transactions burn {actual}")]
    FeeMismatch { declared: u64, actual: u64 },

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Unspent set conflict: {0}")]
    Conflict(String),

    #[error("Duplicate transaction: {0}")]
    Duplicate(String),

    #[error("Unconfirmed pool is full")]
    PoolFull,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Bincode error: {0}")]
    BincodeError(String),
}

impl ChainError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ChainError::Verification(e) => e.class(),
            ChainError::UnauthorizedBlock(_)
            | ChainError::BodyHashMismatch { .. }
            | ChainError::FeeMismatch { .. } => ErrorClass::Integrity,
            ChainError::ChainDiscontinuity(_)
            | ChainError::Conflict(_)
            | ChainError::Duplicate(_)
            | ChainError::NotFound(_) => ErrorClass::Consistency,
            ChainError::NonMonotonicTimestamp { .. }
            | ChainError::InvalidBlock(_)
            | ChainError::InvalidAddress(_)
            | ChainError::CryptoError(_) => ErrorClass::Structural,
            ChainError::PoolFull => ErrorClass::Policy,
            ChainError::DatabaseError(_)
            | ChainError::ConfigError(_)
            | ChainError::IoError(_)
            | ChainError::BincodeError(_) => ErrorClass::Internal,
        }
    }

    /// The verifier failure wrapped by this error, if any.
    pub fn verification(&self) -> Option<&VerificationError> {
        match self {
            ChainError::Verification(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::BincodeError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
