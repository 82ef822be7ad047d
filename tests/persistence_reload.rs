//! Reopening a SQLite-backed ledger

mod common;

use common::*;
use fibercoin::crypto::KeyPair;
use fibercoin::distribution::LockPolicy;
use fibercoin::persistence::Database;
use fibercoin::ChainError;
use std::sync::Arc;

#[test]
fn test_reopen_restores_head_and_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    let authority = KeyPair::generate();
    let owner = KeyPair::generate();
    let alice = KeyPair::generate();

    let (head, root, count, block, alice_out) = {
        let f = Fixture {
            visor: open_visor(
                Arc::new(Database::open(&path).unwrap()),
                &authority,
                &owner,
                LockPolicy::unrestricted(),
            ),
            authority: authority.clone(),
            owner: owner.clone(),
        };
        let tx = pay(&owner, &f.genesis_output(), &alice, 7_000_000);
        let block = f.signed_block(vec![tx.clone()], GENESIS_TIME + 60);
        f.visor.apply_block(&block).unwrap();
        (
            f.visor.head().unwrap(),
            f.visor.snapshot_root(),
            f.visor.ledger().unspent().len(),
            block,
            output_of(&f, &tx, 0),
        )
    };

    let reopened = open_visor(
        Arc::new(Database::open(&path).unwrap()),
        &authority,
        &owner,
        LockPolicy::unrestricted(),
    );
    assert_eq!(reopened.head(), Some(head));
    assert_eq!(reopened.snapshot_root(), root);
    assert_eq!(reopened.ledger().unspent().len(), count);
    assert_eq!(reopened.get_output(&alice_out.id()), Some(alice_out));
    assert_eq!(reopened.get_block(1).unwrap(), Some(block));
}

#[test]
fn test_reopen_with_different_genesis_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    let authority = KeyPair::generate();

    open_visor(
        Arc::new(Database::open(&path).unwrap()),
        &authority,
        &KeyPair::generate(),
        LockPolicy::unrestricted(),
    );

    let result = fibercoin::visor::Visor::open_with(
        Arc::new(Database::open(&path).unwrap()),
        Arc::new(fibercoin::blockchain::PublicKeyAuthority::new(authority.public_key)),
        Arc::new(LockPolicy::unrestricted()),
        genesis_params(&KeyPair::generate()),
        Default::default(),
        Default::default(),
        Default::default(),
    );
    assert!(matches!(result, Err(ChainError::ConfigError(_))));
}

#[test]
fn test_rejected_block_leaves_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    let authority = KeyPair::generate();
    let owner = KeyPair::generate();

    let root = {
        let f = Fixture {
            visor: open_visor(
                Arc::new(Database::open(&path).unwrap()),
                &authority,
                &owner,
                LockPolicy::unrestricted(),
            ),
            authority: authority.clone(),
            owner: owner.clone(),
        };
        let tx = pay(&owner, &f.genesis_output(), &KeyPair::generate(), 1_000_000);
        let mut block = f.visor.ledger().new_block(vec![tx], GENESIS_TIME + 60).unwrap();
        block.header.fee += 1;
        block.sign(&authority);
        assert!(f.visor.apply_block(&block).is_err());
        f.visor.snapshot_root()
    };

    let reopened = open_visor(
        Arc::new(Database::open(&path).unwrap()),
        &authority,
        &owner,
        LockPolicy::unrestricted(),
    );
    assert_eq!(reopened.head().unwrap().seq, 0);
    assert_eq!(reopened.snapshot_root(), root);
    assert_eq!(reopened.get_block(1).unwrap(), None);
}
