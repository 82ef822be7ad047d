//! Transactions: wire types, hashing, signing and verification

pub mod types;
pub mod validation;

pub use types::*;
pub use validation::{VerifiedTx, VerifyParams};
