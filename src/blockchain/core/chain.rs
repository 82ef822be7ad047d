use crate::crypto::{verify_pubkey_signature, public_key_from_hex, Address, KeyPair, Signature};
use crate::distribution::LockPolicy;
use crate::error::{ChainError, Result, VerificationError};
use crate::persistence::{Persistence, WriteBatch, BUCKET_BLOCKS};
use crate::transaction::{Transaction, TransactionOutput, VerifiedTx, VerifyParams};
use lru::LruCache;
use parking_lot::Mutex;
use secp256k1::PublicKey;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{info, warn};

use super::state::{ChainHead, UnspentPool, UtxoBatch, UxOut};
use super::validation::{
    stage_transactions, validate_authority, validate_body_hash, validate_body_size, validate_fee,
    validate_linkage,
};

pub type Sha256Hash = [u8; 32];

/// Default cap on the encoded size of a block's transactions.
pub const DEFAULT_MAX_BLOCK_TRANSACTIONS_SIZE: usize = 32 * 1024;

const BLOCK_CACHE_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockHeader {
    pub seq: u64,
    pub time: u64,
    pub prev_hash: Sha256Hash,
    pub body_hash: Sha256Hash,
    /// Coin hours burned by the block's transactions.
    pub fee: u64,
}

impl BlockHeader {
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.seq.to_le_bytes());
        hasher.update(self.time.to_le_bytes());
        hasher.update(self.prev_hash);
        hasher.update(self.body_hash);
        hasher.update(self.fee.to_le_bytes());
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Authority signature over `header.hash()`.
    pub signature: Signature,
}

impl Block {
    /// Unsigned block committing to `transactions`.
    pub fn new(
        seq: u64,
        prev_hash: Sha256Hash,
        time: u64,
        fee: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        let body_hash = Block::calculate_body_hash(&transactions);
        Block {
            header: BlockHeader {
                seq,
                time,
                prev_hash,
                body_hash,
                fee,
            },
            transactions,
            signature: Signature::NULL,
        }
    }

    pub fn hash(&self) -> Sha256Hash {
        self.header.hash()
    }

    pub fn calculate_body_hash(transactions: &[Transaction]) -> Sha256Hash {
        let mut hasher = Sha256::new();
        for tx in transactions {
            hasher.update(tx.hash());
        }
        hasher.finalize().into()
    }

    pub fn sign(&mut self, keypair: &KeyPair) {
        self.signature = keypair.sign_digest(&self.hash());
    }

    /// Encoded size of all transactions.
    pub fn body_size(&self) -> std::result::Result<usize, VerificationError> {
        self.transactions
            .iter()
            .try_fold(0usize, |acc, tx| Ok(acc.saturating_add(tx.size()?)))
    }

    /// Every output id consumed by this block.
    pub fn spent_inputs(&self) -> impl Iterator<Item = &Sha256Hash> {
        self.transactions.iter().flat_map(|tx| tx.inputs.iter())
    }
}

/// Decides whether a block signature comes from the block publisher.
pub trait BlockAuthority: Send + Sync {
    fn verify(&self, header_hash: &Sha256Hash, signature: &Signature) -> bool;
}

/// Authority identified by a single secp256k1 public key.
#[derive(Debug, Clone)]
pub struct PublicKeyAuthority {
    public_key: PublicKey,
}

impl PublicKeyAuthority {
    pub fn new(public_key: PublicKey) -> Self {
        PublicKeyAuthority { public_key }
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        Ok(Self::new(public_key_from_hex(hex_str)?))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

impl BlockAuthority for PublicKeyAuthority {
    fn verify(&self, header_hash: &Sha256Hash, signature: &Signature) -> bool {
        verify_pubkey_signature(&self.public_key, header_hash, signature).is_ok()
    }
}

/// Parameters of the first block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenesisParams {
    pub address: Address,
    /// Droplets paid to `address`, also its initial coin hours.
    pub coin_volume: u64,
    pub timestamp: u64,
}

impl GenesisParams {
    /// The genesis block: one input-less transaction paying the whole
    /// coin volume to the genesis address. Never signed.
    pub fn block(&self) -> Block {
        let tx = Transaction::new(
            Vec::new(),
            vec![TransactionOutput::new(
                self.address,
                self.coin_volume,
                self.coin_volume,
            )],
        );
        Block::new(0, [0u8; 32], self.timestamp, 0, vec![tx])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerParams {
    /// Rules applied to transactions inside blocks.
    pub verify: VerifyParams,
    pub max_block_transactions_size: usize,
}

impl Default for LedgerParams {
    fn default() -> Self {
        LedgerParams {
            verify: VerifyParams::default(),
            max_block_transactions_size: DEFAULT_MAX_BLOCK_TRANSACTIONS_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadState {
    /// Nothing applied yet, not even the genesis block.
    Genesis,
    Head(ChainHead),
}

/// Applies authority-signed blocks to the unspent set, one at a time.
pub struct Ledger {
    unspent: UnspentPool,
    persistence: Arc<dyn Persistence>,
    authority: Arc<dyn BlockAuthority>,
    policy: Arc<LockPolicy>,
    genesis: GenesisParams,
    params: LedgerParams,
    writer: Mutex<()>,
    block_cache: Mutex<LruCache<u64, Block>>,
}

impl Ledger {
    /// Opens the ledger stored in `persistence`. A fresh store stays in the
    /// `Genesis` state until [`Ledger::initialize`] is called.
    pub fn open(
        persistence: Arc<dyn Persistence>,
        authority: Arc<dyn BlockAuthority>,
        policy: Arc<LockPolicy>,
        genesis: GenesisParams,
        params: LedgerParams,
    ) -> Result<Self> {
        let unspent = UnspentPool::load(persistence.clone())?;
        let capacity = NonZeroUsize::new(BLOCK_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        let ledger = Ledger {
            unspent,
            persistence,
            authority,
            policy,
            genesis,
            params,
            writer: Mutex::new(()),
            block_cache: Mutex::new(LruCache::new(capacity)),
        };

        if ledger.unspent.head().is_some() {
            let expected = ledger.genesis.block().hash();
            match ledger.get_block(0)? {
                Some(stored) if stored.hash() == expected => {}
                Some(stored) => {
                    return Err(ChainError::ConfigError(format!(
                        "stored genesis block {} does not match configured genesis {}",
                        hex::encode(stored.hash()),
                        hex::encode(expected)
                    )))
                }
                None => {
                    return Err(ChainError::DatabaseError(
                        "store has a head but no genesis block".to_string(),
                    ))
                }
            }
        }
        Ok(ledger)
    }

    /// Applies the genesis block if nothing has been applied yet.
    pub fn initialize(&self) -> Result<ChainHead> {
        let _writer = self.writer.lock();
        if let Some(head) = self.unspent.head() {
            return Ok(head);
        }

        let block = self.genesis.block();
        let hash = block.hash();
        let mut batch = UtxoBatch::default();
        for tx in &block.transactions {
            let txid = tx.hash();
            for (index, output) in tx.outputs.iter().enumerate() {
                batch.created.push(UxOut {
                    src_transaction: txid,
                    output_index: index as u16,
                    address: output.address,
                    coins: output.coins,
                    hours: output.hours,
                    block_seq: 0,
                    head_time: block.header.time,
                });
            }
        }
        let head = ChainHead {
            seq: 0,
            hash,
            time: block.header.time,
        };
        batch.head = Some(head);

        self.commit(block, batch)?;
        info!(
            hash = %hex::encode(hash),
            address = %self.genesis.address,
            coins = self.genesis.coin_volume,
            "genesis block applied"
        );
        Ok(head)
    }

    pub fn head(&self) -> Option<ChainHead> {
        self.unspent.head()
    }

    pub fn head_state(&self) -> HeadState {
        match self.head() {
            Some(head) => HeadState::Head(head),
            None => HeadState::Genesis,
        }
    }

    pub fn unspent(&self) -> &UnspentPool {
        &self.unspent
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    pub fn genesis(&self) -> &GenesisParams {
        &self.genesis
    }

    pub fn params(&self) -> &LedgerParams {
        &self.params
    }

    pub fn get_output(&self, id: &Sha256Hash) -> Option<UxOut> {
        self.unspent.get(id)
    }

    pub fn snapshot_root(&self) -> Sha256Hash {
        self.unspent.snapshot_root()
    }

    /// Verifies `tx` against the current unspent set at the head block time.
    pub fn verify_transaction(
        &self,
        tx: &Transaction,
        params: &VerifyParams,
    ) -> Result<VerifiedTx> {
        let snapshot = self.unspent.snapshot();
        let time = snapshot
            .head()
            .map(|h| h.time)
            .unwrap_or(self.genesis.timestamp);
        Ok(tx.verify(&snapshot, &self.policy, time, params)?)
    }

    /// Validates `block` and, if every check passes, commits it as the new head.
    pub fn apply_block(&self, block: &Block) -> Result<ChainHead> {
        let _writer = self.writer.lock();

        let (batch, head) = {
            let snapshot = self.unspent.snapshot();
            let current = snapshot.head().ok_or_else(|| {
                ChainError::ChainDiscontinuity("ledger has no genesis block".to_string())
            })?;

            self.validate_header(block, &current)
                .inspect_err(|e| warn!(seq = block.header.seq, error = %e, "block rejected"))?;

            let (mut batch, fee) = stage_transactions(
                &block.transactions,
                &snapshot,
                block.header.seq,
                block.header.time,
                &self.policy,
                &self.params.verify,
            )?;

            validate_body_hash(block)?;
            validate_fee(&block.header, fee)?;

            let head = ChainHead {
                seq: block.header.seq,
                hash: block.hash(),
                time: block.header.time,
            };
            batch.head = Some(head);
            (batch, head)
        };

        let spent = batch.spent.len();
        let created = batch.created.len();
        self.commit(block.clone(), batch)?;

        info!(
            seq = head.seq,
            hash = %hex::encode(head.hash),
            txs = block.transactions.len(),
            spent,
            created,
            fee = block.header.fee,
            "block applied"
        );
        Ok(head)
    }

    fn validate_header(&self, block: &Block, head: &ChainHead) -> Result<()> {
        validate_authority(block, self.authority.as_ref())?;
        validate_linkage(head, &block.header)?;
        validate_body_size(block, self.params.max_block_transactions_size)
    }

    /// Builds an unsigned block on top of the head from already-ordered
    /// transactions. Fails if any of them does not verify in sequence.
    pub fn new_block(&self, transactions: Vec<Transaction>, time: u64) -> Result<Block> {
        let snapshot = self.unspent.snapshot();
        let head = snapshot.head().ok_or_else(|| {
            ChainError::ChainDiscontinuity("ledger has no genesis block".to_string())
        })?;
        if time <= head.time {
            return Err(ChainError::NonMonotonicTimestamp {
                head: head.time,
                block: time,
            });
        }

        let (_, fee) = stage_transactions(
            &transactions,
            &snapshot,
            head.seq + 1,
            time,
            &self.policy,
            &self.params.verify,
        )?;
        let block = Block::new(head.seq + 1, head.hash, time, fee, transactions);
        validate_body_size(&block, self.params.max_block_transactions_size)?;
        Ok(block)
    }

    pub fn get_block(&self, seq: u64) -> Result<Option<Block>> {
        if let Some(block) = self.block_cache.lock().get(&seq) {
            return Ok(Some(block.clone()));
        }
        let raw = match self.persistence.get(BUCKET_BLOCKS, &seq.to_be_bytes())? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let block: Block = bincode::deserialize(&raw)?;
        self.block_cache.lock().put(seq, block.clone());
        Ok(Some(block))
    }

    fn commit(&self, block: Block, batch: UtxoBatch) -> Result<()> {
        let seq = block.header.seq;
        let mut extra = WriteBatch::new();
        extra.put(BUCKET_BLOCKS, seq.to_be_bytes().to_vec(), bincode::serialize(&block)?);
        self.unspent.apply_block(batch, extra)?;
        self.block_cache.lock().put(seq, block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;

    const GENESIS_TIME: u64 = 1_637_895_025;

    fn setup() -> (KeyPair, KeyPair, Ledger) {
        let authority = KeyPair::generate();
        let genesis_owner = KeyPair::generate();
        let ledger = Ledger::open(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(PublicKeyAuthority::new(authority.public_key)),
            Arc::new(LockPolicy::unrestricted()),
            GenesisParams {
                address: genesis_owner.address(),
                coin_volume: 100_000_000,
                timestamp: GENESIS_TIME,
            },
            LedgerParams::default(),
        )
        .unwrap();
        (authority, genesis_owner, ledger)
    }

    #[test]
    fn test_genesis_transition() {
        let (_, owner, ledger) = setup();
        assert_eq!(ledger.head_state(), HeadState::Genesis);

        let head = ledger.initialize().unwrap();
        assert_eq!(head.seq, 0);
        assert_eq!(head.time, GENESIS_TIME);
        assert_eq!(ledger.head_state(), HeadState::Head(head));
        assert_eq!(ledger.unspent().len(), 1);

        let outs = ledger.unspent().outputs_for_address(&owner.address());
        assert_eq!(outs[0].coins, 100_000_000);
        assert_eq!(outs[0].hours, 100_000_000);

        // idempotent
        assert_eq!(ledger.initialize().unwrap(), head);
        assert_eq!(ledger.unspent().len(), 1);
    }

    #[test]
    fn test_genesis_block_is_deterministic() {
        let params = GenesisParams {
            address: KeyPair::generate().address(),
            coin_volume: 42_000_000,
            timestamp: 7,
        };
        assert_eq!(params.block().hash(), params.block().hash());
        assert!(params.block().transactions[0].inputs.is_empty());
    }

    #[test]
    fn test_block_before_genesis_is_discontinuous() {
        let (authority, _, ledger) = setup();
        let mut block = Block::new(1, [0; 32], GENESIS_TIME + 10, 0, vec![]);
        block.sign(&authority);
        assert!(matches!(
            ledger.apply_block(&block),
            Err(ChainError::ChainDiscontinuity(_))
        ));
    }

    #[test]
    fn test_unsigned_block_is_unauthorized() {
        let (_, _, ledger) = setup();
        let head = ledger.initialize().unwrap();
        let block = Block::new(1, head.hash, head.time + 10, 0, vec![]);
        assert!(matches!(
            ledger.apply_block(&block),
            Err(ChainError::UnauthorizedBlock(_))
        ));
    }

    #[test]
    fn test_empty_block_rejected() {
        let (authority, _, ledger) = setup();
        let head = ledger.initialize().unwrap();
        let mut block = Block::new(1, head.hash, head.time + 10, 0, vec![]);
        block.sign(&authority);
        assert!(matches!(
            ledger.apply_block(&block),
            Err(ChainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_header_hash_covers_every_field() {
        let block = Block::new(3, [1; 32], 99, 5, vec![]);
        let base = block.hash();

        let mut h = block.header.clone();
        h.fee += 1;
        assert_ne!(h.hash(), base);

        let mut h = block.header.clone();
        h.time += 1;
        assert_ne!(h.hash(), base);

        let mut h = block.header.clone();
        h.body_hash = [2; 32];
        assert_ne!(h.hash(), base);
    }

    #[test]
    fn test_public_key_authority() {
        let key = KeyPair::generate();
        let authority = PublicKeyAuthority::new(key.public_key);
        let mut block = Block::new(1, [0; 32], 1, 0, vec![]);
        assert!(!authority.verify(&block.hash(), &block.signature));
        block.sign(&key);
        assert!(authority.verify(&block.hash(), &block.signature));
        block.header.time += 1;
        assert!(!authority.verify(&block.hash(), &block.signature));
    }
}
