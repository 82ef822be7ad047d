//! Fibercoin - ledger core of a fiber-coin node
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Ledger
//! - [`blockchain`] - Blocks, the unspent output set and block application
//! - [`transaction`] - Transaction encoding, signing and verification
//! - [`mempool`] - Unconfirmed transaction pool
//! - [`visor`] - Facade tying the ledger and the pool together
//!
//! ## Economics
//! - [`coin`] - Droplet and coin-hour arithmetic
//! - [`distribution`] - Distribution addresses and their unlock schedule
//!
//! ## Cryptography
//! - [`crypto`] - Addresses, hashing and recoverable signatures (secp256k1)
//!
//! ## Storage
//! - [`persistence`] - Key/value buckets over SQLite, or in memory
//!
//! ## Node & Integration
//! - [`node`] - Node runtime and background tasks
//! - [`api`] - REST API
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Ledger
// ============================================================================
pub mod blockchain;
pub mod mempool;
pub mod transaction;
pub mod visor;

// ============================================================================
// Economics
// ============================================================================
pub mod coin;
pub mod distribution;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// Storage
// ============================================================================
pub mod persistence;

// ============================================================================
// Node & Integration
// ============================================================================
#[cfg(feature = "api")]
pub mod api;
#[cfg(feature = "api")]
pub mod node;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

pub use error::{ChainError, ErrorClass, Result, VerificationError};
