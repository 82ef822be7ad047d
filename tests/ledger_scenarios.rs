//! Block application against the unspent set

mod common;

use common::*;
use fibercoin::blockchain::{Block, HeadState, Sha256Hash, UxOut};
use fibercoin::crypto::KeyPair;
use fibercoin::distribution::{Distribution, LockPolicy};
use fibercoin::persistence::InMemoryPersistence;
use fibercoin::transaction::TransactionOutput;
use fibercoin::{ChainError, ErrorClass, VerificationError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

#[test]
fn test_genesis_applied_on_open() {
    let f = Fixture::new();
    let head = f.visor.head().unwrap();
    assert_eq!(head.seq, 0);
    assert_eq!(head.time, GENESIS_TIME);
    assert!(matches!(f.visor.head_state(), HeadState::Head(_)));

    let genesis = f.genesis_output();
    assert_eq!(genesis.coins, GENESIS_COINS);
    assert_eq!(genesis.hours, GENESIS_COINS);
    assert_eq!(genesis.block_seq, 0);

    let stored = f.visor.get_block(0).unwrap().unwrap();
    assert_eq!(stored.hash(), head.hash);
}

#[test]
fn test_dependent_blocks_apply_in_order() {
    let f = Fixture::new();
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();

    let tx1 = pay(&f.owner, &f.genesis_output(), &alice, 10_000_000);
    let b1 = f.signed_block(vec![tx1.clone()], GENESIS_TIME + 10);
    let head1 = f.visor.apply_block(&b1).unwrap();
    assert_eq!(head1.seq, 1);
    assert_eq!(head1.hash, b1.hash());

    let alice_out = output_of(&f, &tx1, 0);
    assert_eq!(alice_out.coins, 10_000_000);
    assert_eq!(alice_out.block_seq, 1);
    assert_eq!(alice_out.head_time, GENESIS_TIME + 10);

    let tx2 = pay(&alice, &alice_out, &bob, 4_000_000);
    let b2 = f.signed_block(vec![tx2.clone()], GENESIS_TIME + 20);
    let head2 = f.visor.apply_block(&b2).unwrap();
    assert_eq!(head2.seq, 2);
    assert_eq!(head2.time, GENESIS_TIME + 20);

    assert!(f.visor.get_output(&alice_out.id()).is_none());
    assert_eq!(output_of(&f, &tx2, 0).coins, 4_000_000);
    assert_eq!(output_of(&f, &tx2, 1).coins, 6_000_000);
}

#[test]
fn test_dependent_block_out_of_order_is_unknown_input() {
    let f = Fixture::new();
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();

    let tx1 = pay(&f.owner, &f.genesis_output(), &alice, 10_000_000);
    let b1 = f.signed_block(vec![tx1.clone()], GENESIS_TIME + 10);
    f.visor.apply_block(&b1).unwrap();
    let tx2 = pay(&alice, &output_of(&f, &tx1, 0), &bob, 4_000_000);
    let b2 = f.signed_block(vec![tx2.clone()], GENESIS_TIME + 20);

    // same genesis and authority, B1 never applied
    let other = open_visor(
        Arc::new(InMemoryPersistence::new()),
        &f.authority,
        &f.owner,
        LockPolicy::unrestricted(),
    );
    let root = other.snapshot_root();

    assert!(matches!(
        other.apply_block(&b2),
        Err(ChainError::ChainDiscontinuity(_))
    ));

    // B2's body relinked directly onto genesis
    let genesis = other.head().unwrap();
    let mut early = Block::new(1, genesis.hash, b2.header.time, b2.header.fee, vec![tx2]);
    early.sign(&f.authority);
    let err = other.apply_block(&early).unwrap_err();
    assert!(matches!(
        err.verification(),
        Some(VerificationError::UnknownInput(_))
    ));
    assert_eq!(err.class(), ErrorClass::Consistency);

    assert_eq!(other.snapshot_root(), root);
    assert_eq!(other.head().unwrap(), genesis);
}

#[test]
fn test_skipped_sequence_is_discontinuity() {
    let f = Fixture::new();
    let head = f.visor.head().unwrap();
    let root = f.visor.snapshot_root();
    let count = f.visor.ledger().unspent().len();

    let tx = pay(&f.owner, &f.genesis_output(), &KeyPair::generate(), 1_000_000);
    let fee = f.visor.verify(&tx).unwrap().fee;
    let mut block = Block::new(head.seq + 2, head.hash, head.time + 10, fee, vec![tx]);
    block.sign(&f.authority);

    assert!(matches!(
        f.visor.apply_block(&block),
        Err(ChainError::ChainDiscontinuity(_))
    ));
    assert_eq!(f.visor.snapshot_root(), root);
    assert_eq!(f.visor.ledger().unspent().len(), count);
    assert_eq!(f.visor.head().unwrap(), head);
}

#[test]
fn test_wrong_parent_is_discontinuity() {
    let f = Fixture::new();
    let head = f.visor.head().unwrap();
    let tx = pay(&f.owner, &f.genesis_output(), &KeyPair::generate(), 1_000_000);
    let fee = f.visor.verify(&tx).unwrap().fee;
    let mut block = Block::new(1, [9u8; 32], head.time + 10, fee, vec![tx]);
    block.sign(&f.authority);

    assert!(matches!(
        f.visor.apply_block(&block),
        Err(ChainError::ChainDiscontinuity(_))
    ));
}

#[test]
fn test_block_time_must_advance() {
    let f = Fixture::new();
    let head = f.visor.head().unwrap();
    let tx = pay(&f.owner, &f.genesis_output(), &KeyPair::generate(), 1_000_000);
    let fee = f.visor.verify(&tx).unwrap().fee;
    let mut block = Block::new(1, head.hash, head.time, fee, vec![tx]);
    block.sign(&f.authority);

    assert!(matches!(
        f.visor.apply_block(&block),
        Err(ChainError::NonMonotonicTimestamp { .. })
    ));
    assert!(matches!(
        f.visor.ledger().new_block(block.transactions.clone(), head.time),
        Err(ChainError::NonMonotonicTimestamp { .. })
    ));
}

#[test]
fn test_foreign_signature_is_unauthorized() {
    let f = Fixture::new();
    let root = f.visor.snapshot_root();
    let tx = pay(&f.owner, &f.genesis_output(), &KeyPair::generate(), 1_000_000);
    let mut block = f.visor.ledger().new_block(vec![tx], GENESIS_TIME + 10).unwrap();
    block.sign(&KeyPair::generate());

    let err = f.visor.apply_block(&block).unwrap_err();
    assert!(matches!(err, ChainError::UnauthorizedBlock(_)));
    assert_eq!(err.class(), ErrorClass::Integrity);
    assert_eq!(f.visor.snapshot_root(), root);
}

#[test]
fn test_double_spend_within_block_rejected() {
    let f = Fixture::new();
    let head = f.visor.head().unwrap();
    let genesis = f.genesis_output();
    let root = f.visor.snapshot_root();

    let a = pay(&f.owner, &genesis, &KeyPair::generate(), 1_000_000);
    let b = pay(&f.owner, &genesis, &KeyPair::generate(), 2_000_000);
    assert!(f.visor.ledger().new_block(vec![a.clone(), b.clone()], head.time + 10).is_err());

    let mut block = Block::new(1, head.hash, head.time + 10, 2 * genesis.hours, vec![a, b]);
    block.sign(&f.authority);
    let err = f.visor.apply_block(&block).unwrap_err();
    assert_eq!(
        err.verification(),
        Some(&VerificationError::UnknownInput(genesis.id()))
    );
    assert_eq!(f.visor.snapshot_root(), root);
}

#[test]
fn test_body_hash_mismatch_rejected() {
    let f = Fixture::new();
    let tx = pay(&f.owner, &f.genesis_output(), &KeyPair::generate(), 1_000_000);
    let mut block = f.visor.ledger().new_block(vec![tx], GENESIS_TIME + 10).unwrap();
    block.header.body_hash = [7u8; 32];
    block.sign(&f.authority);

    assert!(matches!(
        f.visor.apply_block(&block),
        Err(ChainError::BodyHashMismatch { .. })
    ));
}

#[test]
fn test_fee_mismatch_rejected() {
    let f = Fixture::new();
    let tx = pay(&f.owner, &f.genesis_output(), &KeyPair::generate(), 1_000_000);
    let mut block = f.visor.ledger().new_block(vec![tx], GENESIS_TIME + 10).unwrap();
    let actual = block.header.fee;
    block.header.fee += 1;
    block.sign(&f.authority);

    let err = f.visor.apply_block(&block).unwrap_err();
    assert_eq!(
        err,
        ChainError::FeeMismatch {
            declared: actual + 1,
            actual
        }
    );
}

#[test]
fn test_locked_distribution_output_rejected_in_block() {
    let owner = KeyPair::generate();
    let distribution = Distribution {
        max_coin_supply: 2_000,
        initial_unlocked_count: 1,
        unlock_address_rate: 1,
        unlock_time_interval: 3600,
        addresses: vec![KeyPair::generate().address(), owner.address()],
    };
    let authority = KeyPair::generate();
    let visor = open_visor(
        Arc::new(InMemoryPersistence::new()),
        &authority,
        &owner,
        LockPolicy::new(distribution, GENESIS_TIME),
    );
    let genesis = visor
        .ledger()
        .unspent()
        .outputs_for_address(&owner.address())
        .remove(0);
    let head = visor.head().unwrap();
    let tx = pay(&owner, &genesis, &KeyPair::generate(), 1_000_000);

    let mut early = Block::new(1, head.hash, GENESIS_TIME + 10, genesis.hours, vec![tx.clone()]);
    early.sign(&authority);
    let err = visor.apply_block(&early).unwrap_err();
    assert!(matches!(
        err.verification(),
        Some(VerificationError::LockedBalance { index: 0, .. })
    ));
    assert_eq!(err.class(), ErrorClass::Policy);

    // the second address unlocks after one interval
    let mut later = visor.ledger().new_block(vec![tx], GENESIS_TIME + 3600).unwrap();
    later.sign(&authority);
    assert!(visor.apply_block(&later).is_ok());
}

#[test]
fn test_replay_yields_identical_state() {
    let f = Fixture::new();
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();

    let tx1 = pay(&f.owner, &f.genesis_output(), &alice, 50_000_000);
    let b1 = f.signed_block(vec![tx1.clone()], GENESIS_TIME + 100);
    f.visor.apply_block(&b1).unwrap();

    let alice_out = output_of(&f, &tx1, 0);
    let change = output_of(&f, &tx1, 1);
    let tx2 = pay(&alice, &alice_out, &bob, 20_000_000);
    let tx3 = spend(
        &f.owner,
        &[&change],
        vec![
            TransactionOutput::new(bob.address(), 1_000_000, 1),
            TransactionOutput::new(f.owner.address(), change.coins - 1_000_000, 0),
        ],
    );
    let b2 = f.signed_block(vec![tx2, tx3], GENESIS_TIME + 7300);
    f.visor.apply_block(&b2).unwrap();

    let replica = open_visor(
        Arc::new(InMemoryPersistence::new()),
        &f.authority,
        &f.owner,
        LockPolicy::unrestricted(),
    );
    replica.apply_block(&b1).unwrap();
    replica.apply_block(&b2).unwrap();

    assert_eq!(replica.head(), f.visor.head());
    assert_eq!(replica.snapshot_root(), f.visor.snapshot_root());
    assert_eq!(
        replica.ledger().unspent().len(),
        f.visor.ledger().unspent().len()
    );
}

#[test]
fn test_coin_supply_conserved_across_blocks() {
    let f = Fixture::new();
    let alice = KeyPair::generate();

    let tx1 = pay(&f.owner, &f.genesis_output(), &alice, 123_000_000);
    f.visor
        .apply_block(&f.signed_block(vec![tx1.clone()], GENESIS_TIME + 10))
        .unwrap();
    let tx2 = pay(&alice, &output_of(&f, &tx1, 0), &f.owner, 23_000);
    f.visor
        .apply_block(&f.signed_block(vec![tx2], GENESIS_TIME + 20))
        .unwrap();

    let unspent = f.visor.ledger().unspent();
    let total: u64 = [f.owner.address(), alice.address()]
        .iter()
        .flat_map(|a| unspent.outputs_for_address(a))
        .map(|ux| ux.coins)
        .sum();
    assert_eq!(total, GENESIS_COINS);
}

#[test]
fn test_applied_blocks_are_readable() {
    let f = Fixture::new();
    let tx = pay(&f.owner, &f.genesis_output(), &KeyPair::generate(), 1_000_000);
    let block = f.signed_block(vec![tx], GENESIS_TIME + 10);
    f.visor.apply_block(&block).unwrap();

    assert_eq!(f.visor.get_block(1).unwrap(), Some(block));
    assert_eq!(f.visor.get_block(2).unwrap(), None);
}

/// `total` droplets split over `n` distinct outputs owned by `owner`.
fn fan_out(owner: &KeyPair, total: u64, n: u64) -> Vec<TransactionOutput> {
    let small: Vec<u64> = (1..n).map(|i| i * 1_000).collect();
    let rest = total - small.iter().sum::<u64>();
    small
        .into_iter()
        .chain(std::iter::once(rest))
        .map(|coins| TransactionOutput::new(owner.address(), coins, 0))
        .collect()
}

#[test]
fn test_readers_never_observe_a_partial_block() {
    const ROUNDS: u64 = 12;
    const READERS: usize = 4;

    let f = Fixture::new();
    let owner = &f.owner;
    let visor = &f.visor;

    let state_of = || {
        let snapshot = visor.ledger().unspent().snapshot();
        (
            snapshot.head().map(|h| h.seq),
            snapshot.len(),
            snapshot.root(),
        )
    };

    let mut expected: HashMap<Option<u64>, (usize, Sha256Hash)> = HashMap::new();
    let (seq, len, root) = state_of();
    expected.insert(seq, (len, root));

    let stop = AtomicBool::new(false);
    let observed: Mutex<Vec<(Option<u64>, usize, Sha256Hash)>> = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for _ in 0..READERS {
            scope.spawn(|| {
                let mut seen = Vec::new();
                loop {
                    seen.push(state_of());
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                }
                observed.lock().unwrap().extend(seen);
            });
        }

        let mut current: Vec<UxOut> = vec![f.genesis_output()];
        for round in 0..ROUNDS {
            let inputs: Vec<&UxOut> = current.iter().collect();
            let tx = spend(owner, &inputs, fan_out(owner, GENESIS_COINS, 5 + round % 4));
            let block = f.signed_block(vec![tx.clone()], GENESIS_TIME + 10 * (round + 1));
            let head = visor.apply_block(&block).unwrap();

            let (seq, len, root) = state_of();
            assert_eq!(seq, Some(head.seq));
            expected.insert(seq, (len, root));
            current = (0..tx.outputs.len() as u16)
                .map(|i| output_of(&f, &tx, i))
                .collect();
        }
        stop.store(true, Ordering::Release);
    });

    let observed = observed.into_inner().unwrap();
    assert!(!observed.is_empty());
    for (seq, len, root) in observed {
        let (want_len, want_root) = expected
            .get(&seq)
            .unwrap_or_else(|| panic!("snapshot at unknown head {:?}", seq));
        assert_eq!(len, *want_len, "unspent count torn at head {:?}", seq);
        assert_eq!(root, *want_root, "snapshot root torn at head {:?}", seq);
    }
}
