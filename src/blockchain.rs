// Block types and validation live in `blockchain/core/`; the unspent set and
// its views live next to them in `state.rs`.

pub mod core;
pub use core::*;
