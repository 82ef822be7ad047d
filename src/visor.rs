//! Ledger facade used by the node, API and CLI
//!
//! `Visor` owns the ledger and the unconfirmed pool and keeps them in step:
//! every applied block prunes the pool, and pool submissions are verified
//! against the same unspent set blocks are applied to.

use crate::blockchain::{
    stage_transaction, Block, BlockAuthority, ChainHead, GenesisParams, HeadState, Ledger,
    LedgerParams, Sha256Hash, UxOut, WorkingView,
};
use crate::config::Config;
use crate::distribution::LockPolicy;
use crate::error::{ChainError, Result};
use crate::crypto::KeyPair;
use crate::mempool::{PoolConfig, UnconfirmedPool};
use crate::persistence::Persistence;
use crate::transaction::{Transaction, VerifiedTx, VerifyParams};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, info};

pub struct Visor {
    ledger: Ledger,
    pool: UnconfirmedPool,
    unconfirmed_params: VerifyParams,
}

impl Visor {
    pub fn new(ledger: Ledger, pool: UnconfirmedPool, unconfirmed_params: VerifyParams) -> Self {
        Visor {
            ledger,
            pool,
            unconfirmed_params,
        }
    }

    /// Opens the ledger in `persistence` with the parameters from `config`
    /// and applies the genesis block if the store is empty.
    pub fn open(config: &Config, persistence: Arc<dyn Persistence>) -> Result<Self> {
        let authority: Arc<dyn BlockAuthority> = Arc::new(config.authority()?);
        Self::open_with(
            persistence,
            authority,
            Arc::new(config.lock_policy()?),
            config.genesis()?,
            config.ledger_params(),
            config.pool,
            config.unconfirmed,
        )
    }

    pub fn open_with(
        persistence: Arc<dyn Persistence>,
        authority: Arc<dyn BlockAuthority>,
        policy: Arc<LockPolicy>,
        genesis: GenesisParams,
        ledger_params: LedgerParams,
        pool_config: PoolConfig,
        unconfirmed_params: VerifyParams,
    ) -> Result<Self> {
        let ledger = Ledger::open(persistence, authority, policy, genesis, ledger_params)?;
        let head = ledger.initialize()?;
        info!(
            seq = head.seq,
            hash = %hex::encode(head.hash),
            unspent = ledger.unspent().len(),
            "visor ready"
        );
        Ok(Self::new(
            ledger,
            UnconfirmedPool::new(pool_config),
            unconfirmed_params,
        ))
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn pool(&self) -> &UnconfirmedPool {
        &self.pool
    }

    pub fn unconfirmed_params(&self) -> &VerifyParams {
        &self.unconfirmed_params
    }

    pub fn head(&self) -> Option<ChainHead> {
        self.ledger.head()
    }

    pub fn head_state(&self) -> HeadState {
        self.ledger.head_state()
    }

    pub fn snapshot_root(&self) -> Sha256Hash {
        self.ledger.snapshot_root()
    }

    pub fn get_output(&self, id: &Sha256Hash) -> Option<UxOut> {
        self.ledger.get_output(id)
    }

    pub fn get_block(&self, seq: u64) -> Result<Option<Block>> {
        self.ledger.get_block(seq)
    }

    /// Verifies `tx` against the unspent set under the unconfirmed rules.
    /// Nothing is stored.
    pub fn verify(&self, tx: &Transaction) -> Result<VerifiedTx> {
        self.ledger.verify_transaction(tx, &self.unconfirmed_params)
    }

    /// Verifies independent transactions in parallel against one snapshot.
    /// Transactions are not checked against each other.
    pub fn verify_batch(&self, txs: &[Transaction]) -> Vec<Result<VerifiedTx>> {
        let snapshot = self.ledger.unspent().snapshot();
        let time = self.current_time(snapshot.head());
        let policy = self.ledger.policy();
        let params = &self.unconfirmed_params;
        txs.par_iter()
            .map(|tx| Ok(tx.verify(&snapshot, policy, time, params)?))
            .collect()
    }

    /// Verifies `tx` and adds it to the unconfirmed pool.
    pub fn submit_to_pool(&self, tx: Transaction) -> Result<VerifiedTx> {
        let received_at = unix_now();
        let snapshot = self.ledger.unspent().snapshot();
        let time = self.current_time(snapshot.head());
        self.pool.submit(
            tx,
            &snapshot,
            self.ledger.policy(),
            time,
            received_at,
            &self.unconfirmed_params,
        )
    }

    /// Applies `block`, then drops pool entries it confirmed or invalidated.
    pub fn apply_block(&self, block: &Block) -> Result<ChainHead> {
        let head = self.ledger.apply_block(block)?;

        let pruned = self.pool.on_block_applied(block);
        let snapshot = self.ledger.unspent().snapshot();
        let invalid = self.pool.remove_invalid(
            &snapshot,
            self.ledger.policy(),
            head.time,
            &self.unconfirmed_params,
        );
        debug!(
            seq = head.seq,
            pruned = pruned.len(),
            invalid = invalid.len(),
            "pool updated after block"
        );
        Ok(head)
    }

    /// Drops pool entries older than the configured horizon.
    pub fn expire_pool(&self, now: u64) -> Vec<Sha256Hash> {
        self.pool.expire(now, self.pool.config().expire_after_secs)
    }

    /// Builds and signs a block from pooled transactions, highest fee first.
    /// Transactions that no longer verify, or do not fit, are skipped.
    pub fn create_block(&self, keypair: &KeyPair, time: u64) -> Result<Block> {
        let head = self
            .head()
            .ok_or_else(|| ChainError::ChainDiscontinuity("ledger has no genesis block".to_string()))?;
        if time <= head.time {
            return Err(ChainError::NonMonotonicTimestamp {
                head: head.time,
                block: time,
            });
        }

        let mut candidates = self.pool.transactions();
        candidates.sort_by(|a, b| b.fee.cmp(&a.fee).then(a.received_at.cmp(&b.received_at)));

        let params = self.ledger.params();
        let mut selected: Vec<Transaction> = Vec::new();
        let mut size = 0usize;
        {
            let snapshot = self.ledger.unspent().snapshot();
            let mut view = WorkingView::new(&snapshot);
            for entry in candidates {
                let tx_size = match entry.transaction.size() {
                    Ok(n) => n,
                    Err(_) => continue,
                };
                if size + tx_size > params.max_block_transactions_size {
                    continue;
                }
                match stage_transaction(
                    &mut view,
                    &entry.transaction,
                    head.seq + 1,
                    time,
                    self.ledger.policy(),
                    &params.verify,
                ) {
                    Ok(_) => {
                        size += tx_size;
                        selected.push(entry.transaction);
                    }
                    Err(e) => debug!(
                        txid = %entry.transaction.hash_str(),
                        error = %e,
                        "skipping pooled transaction"
                    ),
                }
            }
        }

        if selected.is_empty() {
            return Err(ChainError::InvalidBlock(
                "no pooled transaction can be included".to_string(),
            ));
        }

        let mut block = self.ledger.new_block(selected, time)?;
        block.sign(keypair);
        Ok(block)
    }

    fn current_time(&self, head: Option<ChainHead>) -> u64 {
        head.map(|h| h.time)
            .unwrap_or(self.ledger.genesis().timestamp)
    }
}

pub fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
