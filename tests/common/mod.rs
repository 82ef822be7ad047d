//! Shared fixtures for the integration tests
#![allow(dead_code)]

use fibercoin::blockchain::{Block, GenesisParams, LedgerParams, PublicKeyAuthority, UxOut};
use fibercoin::crypto::KeyPair;
use fibercoin::distribution::LockPolicy;
use fibercoin::mempool::PoolConfig;
use fibercoin::persistence::{InMemoryPersistence, Persistence};
use fibercoin::transaction::{Transaction, TransactionOutput, VerifyParams};
use fibercoin::visor::Visor;
use std::sync::Arc;

pub const GENESIS_TIME: u64 = 1_637_895_025;
/// 1000 coins.
pub const GENESIS_COINS: u64 = 1_000_000_000;

pub struct Fixture {
    pub authority: KeyPair,
    pub owner: KeyPair,
    pub visor: Visor,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_policy(LockPolicy::unrestricted())
    }

    pub fn with_policy(policy: LockPolicy) -> Self {
        let authority = KeyPair::generate();
        let owner = KeyPair::generate();
        let visor = open_visor(
            Arc::new(InMemoryPersistence::new()),
            &authority,
            &owner,
            policy,
        );
        Fixture {
            authority,
            owner,
            visor,
        }
    }

    pub fn genesis_output(&self) -> UxOut {
        self.visor
            .ledger()
            .unspent()
            .outputs_for_address(&self.owner.address())
            .remove(0)
    }

    /// Signed block on top of the current head.
    pub fn signed_block(&self, txs: Vec<Transaction>, time: u64) -> Block {
        let mut block = self.visor.ledger().new_block(txs, time).unwrap();
        block.sign(&self.authority);
        block
    }
}

pub fn genesis_params(owner: &KeyPair) -> GenesisParams {
    GenesisParams {
        address: owner.address(),
        coin_volume: GENESIS_COINS,
        timestamp: GENESIS_TIME,
    }
}

pub fn open_visor(
    persistence: Arc<dyn Persistence>,
    authority: &KeyPair,
    owner: &KeyPair,
    policy: LockPolicy,
) -> Visor {
    Visor::open_with(
        persistence,
        Arc::new(PublicKeyAuthority::new(authority.public_key)),
        Arc::new(policy),
        genesis_params(owner),
        LedgerParams::default(),
        PoolConfig::default(),
        VerifyParams::default(),
    )
    .unwrap()
}

/// Transaction spending `inputs`, all owned by `owner`.
pub fn spend(owner: &KeyPair, inputs: &[&UxOut], outputs: Vec<TransactionOutput>) -> Transaction {
    let mut tx = Transaction::new(inputs.iter().map(|ux| ux.id()).collect(), outputs);
    let keys: Vec<&KeyPair> = inputs.iter().map(|_| owner).collect();
    tx.sign_inputs(&keys).unwrap();
    tx
}

/// Splits `input` into `to` receiving `amount` and change back to `owner`.
/// All coin hours are burned.
pub fn pay(owner: &KeyPair, input: &UxOut, to: &KeyPair, amount: u64) -> Transaction {
    let mut outputs = vec![TransactionOutput::new(to.address(), amount, 0)];
    if input.coins > amount {
        outputs.push(TransactionOutput::new(owner.address(), input.coins - amount, 0));
    }
    spend(owner, &[input], outputs)
}

/// The output at `index` created by `tx` once it is confirmed.
pub fn output_of(fixture: &Fixture, tx: &Transaction, index: u16) -> UxOut {
    let id = fibercoin::blockchain::ux_id(&tx.hash(), index);
    fixture.visor.get_output(&id).unwrap()
}
