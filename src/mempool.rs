//! Unconfirmed transaction pool
//!
//! Holds verified transactions that are not yet in a block. A transaction is
//! admitted only if it verifies against the unspent set with every input
//! already claimed by a pooled transaction hidden, so the first transaction
//! to claim an output wins and later conflicting ones are rejected.

use crate::blockchain::{Block, Sha256Hash, UtxoView, UxOut};
use crate::distribution::LockPolicy;
use crate::error::{ChainError, Result, VerificationError};
use crate::transaction::{Transaction, VerifiedTx, VerifyParams};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

pub const DEFAULT_MAX_TRANSACTIONS: usize = 10_000;
/// One hour.
pub const DEFAULT_EXPIRE_AFTER_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_transactions")]
    pub max_transactions: usize,
    /// Entries older than this are dropped by `expire`.
    #[serde(default = "default_expire_after_secs")]
    pub expire_after_secs: u64,
    /// How often the node runs `expire`.
    #[serde(default = "default_expire_check_secs")]
    pub expire_check_secs: u64,
}

fn default_max_transactions() -> usize {
    DEFAULT_MAX_TRANSACTIONS
}
fn default_expire_after_secs() -> u64 {
    DEFAULT_EXPIRE_AFTER_SECS
}
fn default_expire_check_secs() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_transactions: DEFAULT_MAX_TRANSACTIONS,
            expire_after_secs: DEFAULT_EXPIRE_AFTER_SECS,
            expire_check_secs: default_expire_check_secs(),
        }
    }
}

/// A pooled transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconfirmedTxn {
    pub transaction: Transaction,
    pub txid: Sha256Hash,
    /// Unix seconds.
    pub received_at: u64,
    pub announced: bool,
    pub fee: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_added: u64,
    pub total_confirmed: u64,
    pub total_conflicted: u64,
    pub total_expired: u64,
    pub total_invalidated: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: HashMap<Sha256Hash, UnconfirmedTxn>,
    /// Input id -> txid of the pooled transaction spending it.
    spent_by: HashMap<Sha256Hash, Sha256Hash>,
    stats: PoolStats,
}

impl PoolState {
    fn remove(&mut self, txid: &Sha256Hash) -> Option<UnconfirmedTxn> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.transaction.inputs {
            if self.spent_by.get(input) == Some(txid) {
                self.spent_by.remove(input);
            }
        }
        Some(entry)
    }
}

/// Base view with outputs claimed by other pooled transactions hidden.
struct PoolView<'a, V: UtxoView + ?Sized> {
    base: &'a V,
    spent_by: &'a HashMap<Sha256Hash, Sha256Hash>,
    owner: Option<Sha256Hash>,
}

impl<V: UtxoView + ?Sized> UtxoView for PoolView<'_, V> {
    fn get(&self, id: &Sha256Hash) -> Option<UxOut> {
        match self.spent_by.get(id) {
            Some(claimant) if Some(*claimant) != self.owner => None,
            _ => self.base.get(id),
        }
    }
}

pub struct UnconfirmedPool {
    config: PoolConfig,
    state: RwLock<PoolState>,
}

impl UnconfirmedPool {
    pub fn new(config: PoolConfig) -> Self {
        UnconfirmedPool {
            config,
            state: RwLock::new(PoolState::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Verifies `tx` and admits it.
    ///
    /// Rejects with `Duplicate` if already pooled, `PoolFull` at capacity,
    /// and `UnknownInput` if another pooled transaction already spends one
    /// of its inputs.
    pub fn submit<V: UtxoView + ?Sized>(
        &self,
        tx: Transaction,
        view: &V,
        policy: &LockPolicy,
        current_time: u64,
        received_at: u64,
        params: &VerifyParams,
    ) -> Result<VerifiedTx> {
        let txid = tx.hash();

        let verified = {
            let state = self.state.read();
            Self::check_admission(&state, &txid, self.config.max_transactions)?;
            let pool_view = PoolView {
                base: view,
                spent_by: &state.spent_by,
                owner: None,
            };
            tx.verify(&pool_view, policy, current_time, params)?
        };

        // Another submitter may have won the race since the read lock was released
        let mut state = self.state.write();
        Self::check_admission(&state, &txid, self.config.max_transactions)?;
        if let Some(input) = tx.inputs.iter().find(|i| state.spent_by.contains_key(*i)) {
            return Err(VerificationError::UnknownInput(*input).into());
        }

        for input in &tx.inputs {
            state.spent_by.insert(*input, txid);
        }
        state.entries.insert(
            txid,
            UnconfirmedTxn {
                transaction: tx,
                txid,
                received_at,
                announced: false,
                fee: verified.fee,
            },
        );
        state.stats.total_added += 1;
        debug!(txid = %hex::encode(txid), fee = verified.fee, size = state.entries.len(), "transaction pooled");
        Ok(verified)
    }

    fn check_admission(state: &PoolState, txid: &Sha256Hash, max: usize) -> Result<()> {
        if state.entries.contains_key(txid) {
            return Err(ChainError::Duplicate(hex::encode(txid)));
        }
        if state.entries.len() >= max {
            return Err(ChainError::PoolFull);
        }
        Ok(())
    }

    /// Drops every entry included in `block` or spending one of its inputs.
    pub fn on_block_applied(&self, block: &Block) -> Vec<Sha256Hash> {
        let spent: HashSet<&Sha256Hash> = block.spent_inputs().collect();
        let included: HashSet<Sha256Hash> = block.transactions.iter().map(|tx| tx.hash()).collect();

        let mut state = self.state.write();
        let doomed: HashSet<Sha256Hash> = state
            .entries
            .values()
            .filter(|e| {
                included.contains(&e.txid) || e.transaction.inputs.iter().any(|i| spent.contains(i))
            })
            .map(|e| e.txid)
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for txid in doomed {
            if state.remove(&txid).is_some() {
                if included.contains(&txid) {
                    state.stats.total_confirmed += 1;
                } else {
                    state.stats.total_conflicted += 1;
                }
                removed.push(txid);
            }
        }
        if !removed.is_empty() {
            debug!(seq = block.header.seq, removed = removed.len(), "pool pruned after block");
        }
        removed
    }

    /// Drops entries received more than `horizon_secs` before `now`.
    pub fn expire(&self, now: u64, horizon_secs: u64) -> Vec<Sha256Hash> {
        let mut state = self.state.write();
        let stale: Vec<Sha256Hash> = state
            .entries
            .values()
            .filter(|e| now.saturating_sub(e.received_at) > horizon_secs)
            .map(|e| e.txid)
            .collect();
        for txid in &stale {
            state.remove(txid);
        }
        state.stats.total_expired += stale.len() as u64;
        if !stale.is_empty() {
            debug!(expired = stale.len(), "pool entries expired");
        }
        stale
    }

    /// Re-verifies every entry and drops the ones that no longer pass.
    pub fn remove_invalid<V: UtxoView + ?Sized>(
        &self,
        view: &V,
        policy: &LockPolicy,
        current_time: u64,
        params: &VerifyParams,
    ) -> Vec<Sha256Hash> {
        let mut state = self.state.write();
        let invalid: Vec<Sha256Hash> = state
            .entries
            .values()
            .filter(|e| {
                let pool_view = PoolView {
                    base: view,
                    spent_by: &state.spent_by,
                    owner: Some(e.txid),
                };
                e.transaction
                    .verify(&pool_view, policy, current_time, params)
                    .is_err()
            })
            .map(|e| e.txid)
            .collect();
        for txid in &invalid {
            state.remove(txid);
        }
        state.stats.total_invalidated += invalid.len() as u64;
        if !invalid.is_empty() {
            debug!(removed = invalid.len(), "invalid pool entries removed");
        }
        invalid
    }

    pub fn mark_announced(&self, txids: &[Sha256Hash]) {
        let mut state = self.state.write();
        for txid in txids {
            if let Some(entry) = state.entries.get_mut(txid) {
                entry.announced = true;
            }
        }
    }

    /// Entries not yet announced to peers, oldest first.
    pub fn unannounced(&self) -> Vec<UnconfirmedTxn> {
        let mut out: Vec<UnconfirmedTxn> = self
            .state
            .read()
            .entries
            .values()
            .filter(|e| !e.announced)
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.received_at, e.txid));
        out
    }

    pub fn get(&self, txid: &Sha256Hash) -> Option<UnconfirmedTxn> {
        self.state.read().entries.get(txid).cloned()
    }

    pub fn contains(&self, txid: &Sha256Hash) -> bool {
        self.state.read().entries.contains_key(txid)
    }

    /// Txid of the pooled transaction spending `input`, if any.
    pub fn spender_of(&self, input: &Sha256Hash) -> Option<Sha256Hash> {
        self.state.read().spent_by.get(input).copied()
    }

    /// All entries, oldest first.
    pub fn transactions(&self) -> Vec<UnconfirmedTxn> {
        let mut out: Vec<UnconfirmedTxn> = self.state.read().entries.values().cloned().collect();
        out.sort_by_key(|e| (e.received_at, e.txid));
        out
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        self.state.read().stats.clone()
    }
}
