/// Validation logic for transactions separated from type definitions
use crate::blockchain::{Sha256Hash, UtxoView, UxOut};
use crate::coin;
use crate::crypto::{add_sha256, verify_address_signature};
use crate::distribution::LockPolicy;
use crate::error::VerificationError;
use crate::transaction::types::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const DEFAULT_BURN_FACTOR: u64 = 10;
pub const DEFAULT_MAX_TRANSACTION_SIZE: usize = 32 * 1024;
pub const DEFAULT_MAX_DROPLET_PRECISION: u8 = 3;

/// Tunable limits applied by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyParams {
    /// One hour in `burn_factor` of every spend must be destroyed.
    #[serde(default = "default_burn_factor")]
    pub burn_factor: u64,
    #[serde(default = "default_max_transaction_size")]
    pub max_transaction_size: usize,
    #[serde(default = "default_max_droplet_precision")]
    pub max_droplet_precision: u8,
}

fn default_burn_factor() -> u64 {
    DEFAULT_BURN_FACTOR
}
fn default_max_transaction_size() -> usize {
    DEFAULT_MAX_TRANSACTION_SIZE
}
fn default_max_droplet_precision() -> u8 {
    DEFAULT_MAX_DROPLET_PRECISION
}

impl Default for VerifyParams {
    fn default() -> Self {
        VerifyParams {
            burn_factor: DEFAULT_BURN_FACTOR,
            max_transaction_size: DEFAULT_MAX_TRANSACTION_SIZE,
            max_droplet_precision: DEFAULT_MAX_DROPLET_PRECISION,
        }
    }
}

/// A transaction that passed every check, with the outputs it spends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedTx {
    pub tx: Transaction,
    pub txid: Sha256Hash,
    pub inputs: Vec<UxOut>,
    /// Coin hours destroyed by this transaction.
    pub fee: u64,
}

impl Transaction {
    /// Checks that need no ledger state: shape, uniqueness, sums and size.
    pub fn verify_structure(&self, params: &VerifyParams) -> Result<(), VerificationError> {
        if self.inputs.is_empty() {
            return Err(VerificationError::NoInputs);
        }
        if self.outputs.is_empty() {
            return Err(VerificationError::NoOutputs);
        }
        if self.signatures.len() != self.inputs.len() {
            return Err(VerificationError::SignatureCountMismatch {
                inputs: self.inputs.len(),
                signatures: self.signatures.len(),
            });
        }

        let mut seen_inputs = HashSet::with_capacity(self.inputs.len());
        for input in &self.inputs {
            if !seen_inputs.insert(input) {
                return Err(VerificationError::DuplicateInput(*input));
            }
        }

        let mut seen_outputs = HashSet::with_capacity(self.outputs.len());
        for (i, output) in self.outputs.iter().enumerate() {
            if output.coins == 0 {
                return Err(VerificationError::ZeroCoinOutput(i));
            }
            if !seen_outputs.insert(output) {
                return Err(VerificationError::DuplicateOutput(i));
            }
        }

        self.output_coins()?;
        self.output_hours()?;
        self.validate_size(params.max_transaction_size)?;
        Ok(())
    }

    /// Full verification against `view` at `current_time`.
    ///
    /// Pure: neither the view nor the policy is modified, so repeating the
    /// call with the same arguments gives the same answer.
    pub fn verify<V: UtxoView + ?Sized>(
        &self,
        view: &V,
        policy: &LockPolicy,
        current_time: u64,
        params: &VerifyParams,
    ) -> Result<VerifiedTx, VerificationError> {
        self.verify_structure(params)?;

        let inputs = self
            .inputs
            .iter()
            .map(|id| view.get(id).ok_or(VerificationError::UnknownInput(*id)))
            .collect::<Result<Vec<UxOut>, _>>()?;

        let inner_hash = self.inner_hash();
        for (i, (ux, signature)) in inputs.iter().zip(&self.signatures).enumerate() {
            let digest = add_sha256(&inner_hash, &self.inputs[i]);
            if verify_address_signature(&ux.address, &digest, signature).is_err() {
                return Err(VerificationError::InvalidSignature(i));
            }
        }

        for (i, ux) in inputs.iter().enumerate() {
            if policy.is_locked(&ux.address, current_time) {
                return Err(VerificationError::LockedBalance {
                    index: i,
                    address: ux.address.to_string(),
                });
            }
        }

        let input_coins = coin::sum(inputs.iter().map(|ux| ux.coins), "input coins")?;
        let output_coins = self.output_coins()?;
        if output_coins > input_coins {
            return Err(VerificationError::InsufficientCoins {
                inputs: input_coins,
                outputs: output_coins,
            });
        }

        let mut input_hours = 0u64;
        for ux in &inputs {
            input_hours = coin::add(input_hours, ux.coin_hours(current_time)?, "input hours")?;
        }
        let output_hours = self.output_hours()?;
        let required_burn = coin::required_burn(input_hours, params.burn_factor);
        let spendable = output_hours
            .checked_add(required_burn)
            .filter(|needed| *needed <= input_hours);
        if spendable.is_none() {
            return Err(VerificationError::InsufficientCoinHours {
                inputs: input_hours,
                outputs: output_hours,
                required_burn,
            });
        }

        for (i, output) in self.outputs.iter().enumerate() {
            if !coin::has_valid_precision(output.coins, params.max_droplet_precision) {
                return Err(VerificationError::InvalidPrecision {
                    index: i,
                    coins: output.coins,
                    max_decimals: params.max_droplet_precision,
                });
            }
        }

        Ok(VerifiedTx {
            tx: self.clone(),
            txid: self.hash(),
            inputs,
            fee: input_hours - output_hours,
        })
    }
}
