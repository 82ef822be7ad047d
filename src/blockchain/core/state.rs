use crate::coin;
use crate::crypto::Address;
use crate::error::{ChainError, Result, VerificationError};
use crate::persistence::{Persistence, WriteBatch, BUCKET_META, BUCKET_UNSPENT, META_HEAD_KEY};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use super::chain::Sha256Hash;

/// Identity of the `index`-th output of transaction `txid`.
pub fn ux_id(txid: &Sha256Hash, index: u16) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(txid);
    hasher.update(index.to_le_bytes());
    hasher.finalize().into()
}

/// An unspent transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UxOut {
    pub src_transaction: Sha256Hash,
    pub output_index: u16,
    pub address: Address,
    pub coins: u64,
    /// Coin hours at creation. Accrual since `head_time` is computed on demand.
    pub hours: u64,
    pub block_seq: u64,
    pub head_time: u64,
}

impl UxOut {
    pub fn id(&self) -> Sha256Hash {
        ux_id(&self.src_transaction, self.output_index)
    }

    /// Commitment to every field, folded into the unspent snapshot root.
    pub fn snapshot_hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.src_transaction);
        hasher.update(self.output_index.to_le_bytes());
        hasher.update(self.address.bytes());
        hasher.update(self.coins.to_le_bytes());
        hasher.update(self.hours.to_le_bytes());
        hasher.update(self.block_seq.to_le_bytes());
        hasher.update(self.head_time.to_le_bytes());
        hasher.finalize().into()
    }

    pub fn coin_hours(&self, current_time: u64) -> std::result::Result<u64, VerificationError> {
        coin::coin_hours_at(self.coins, self.hours, self.head_time, current_time)
    }
}

/// Block the unspent set currently reflects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub seq: u64,
    pub hash: Sha256Hash,
    pub time: u64,
}

/// Read access to a set of unspent outputs.
pub trait UtxoView {
    fn get(&self, id: &Sha256Hash) -> Option<UxOut>;

    fn has(&self, id: &Sha256Hash) -> bool {
        self.get(id).is_some()
    }
}

impl UtxoView for HashMap<Sha256Hash, UxOut> {
    fn get(&self, id: &Sha256Hash) -> Option<UxOut> {
        HashMap::get(self, id).cloned()
    }
}

impl<V: UtxoView + ?Sized> UtxoView for &V {
    fn get(&self, id: &Sha256Hash) -> Option<UxOut> {
        (**self).get(id)
    }
}

/// Changes produced by one block: outputs to remove and outputs to add.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoBatch {
    pub spent: BTreeSet<Sha256Hash>,
    pub created: Vec<UxOut>,
    /// New head recorded together with the output changes.
    pub head: Option<ChainHead>,
}

#[derive(Debug)]
struct UnspentState {
    outputs: HashMap<Sha256Hash, UxOut>,
    /// Snapshot hash of every output, keyed by output id.
    commitments: BTreeMap<Sha256Hash, Sha256Hash>,
    root: Sha256Hash,
    head: Option<ChainHead>,
}

impl UnspentState {
    fn new() -> Self {
        let mut state = UnspentState {
            outputs: HashMap::new(),
            commitments: BTreeMap::new(),
            root: [0u8; 32],
            head: None,
        };
        state.refresh_root();
        state
    }

    fn insert(&mut self, ux: UxOut) {
        let id = ux.id();
        self.commitments.insert(id, ux.snapshot_hash());
        self.outputs.insert(id, ux);
    }

    fn remove(&mut self, id: &Sha256Hash) {
        self.outputs.remove(id);
        self.commitments.remove(id);
    }

    /// `SHA256(count || snapshot hashes in output id order)`.
    fn refresh_root(&mut self) {
        let mut hasher = Sha256::new();
        hasher.update((self.commitments.len() as u64).to_le_bytes());
        for hash in self.commitments.values() {
            hasher.update(hash);
        }
        self.root = hasher.finalize().into();
    }
}

/// The authoritative set of unspent outputs, mirrored to the store.
pub struct UnspentPool {
    state: RwLock<UnspentState>,
    persistence: Arc<dyn Persistence>,
}

impl UnspentPool {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        UnspentPool {
            state: RwLock::new(UnspentState::new()),
            persistence,
        }
    }

    /// Rebuilds the in-memory image from whatever the store holds.
    pub fn load(persistence: Arc<dyn Persistence>) -> Result<Self> {
        let mut state = UnspentState::new();
        for (key, value) in persistence.scan(BUCKET_UNSPENT)? {
            let ux: UxOut = bincode::deserialize(&value)?;
            if ux.id().as_slice() != key.as_slice() {
                return Err(ChainError::DatabaseError(format!(
                    "unspent output stored under wrong key {}",
                    hex::encode(&key)
                )));
            }
            state.insert(ux);
        }
        if let Some(raw) = persistence.get(BUCKET_META, META_HEAD_KEY)? {
            state.head = Some(bincode::deserialize(&raw)?);
        }
        state.refresh_root();

        info!(
            outputs = state.outputs.len(),
            head = ?state.head.map(|h| h.seq),
            "unspent pool loaded"
        );
        Ok(UnspentPool {
            state: RwLock::new(state),
            persistence,
        })
    }

    pub fn get(&self, id: &Sha256Hash) -> Option<UxOut> {
        self.state.read().outputs.get(id).cloned()
    }

    pub fn has(&self, id: &Sha256Hash) -> bool {
        self.state.read().outputs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.read().outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().outputs.is_empty()
    }

    pub fn head(&self) -> Option<ChainHead> {
        self.state.read().head
    }

    pub fn snapshot_root(&self) -> Sha256Hash {
        self.state.read().root
    }

    /// Every unspent output owned by `address`, ordered by block then output id.
    pub fn outputs_for_address(&self, address: &Address) -> Vec<UxOut> {
        let state = self.state.read();
        let mut outs: Vec<UxOut> = state
            .outputs
            .values()
            .filter(|ux| &ux.address == address)
            .cloned()
            .collect();
        outs.sort_by(|a, b| (a.block_seq, a.id()).cmp(&(b.block_seq, b.id())));
        outs
    }

    /// Consistent read-only view. Writers wait until it is dropped.
    pub fn snapshot(&self) -> UnspentSnapshot<'_> {
        UnspentSnapshot {
            guard: self.state.read(),
        }
    }

    /// Applies `batch` atomically, together with any `extra` store writes.
    ///
    /// Fails with `Conflict` if a spent output is absent or a created output
    /// already exists. On failure neither the store nor memory change.
    pub fn apply_block(&self, batch: UtxoBatch, extra: WriteBatch) -> Result<()> {
        let mut state = self.state.write();

        for id in &batch.spent {
            if !state.outputs.contains_key(id) {
                return Err(ChainError::Conflict(format!(
                    "spent output {} is not in the unspent set",
                    hex::encode(id)
                )));
            }
        }
        let mut created_ids = BTreeSet::new();
        for ux in &batch.created {
            let id = ux.id();
            let survives = state.outputs.contains_key(&id) && !batch.spent.contains(&id);
            if survives || !created_ids.insert(id) {
                return Err(ChainError::Conflict(format!(
                    "created output {} already exists",
                    hex::encode(id)
                )));
            }
        }

        let mut writes = WriteBatch::new();
        for id in &batch.spent {
            writes.delete(BUCKET_UNSPENT, id.to_vec());
        }
        for ux in &batch.created {
            writes.put(BUCKET_UNSPENT, ux.id().to_vec(), bincode::serialize(ux)?);
        }
        if let Some(head) = &batch.head {
            writes.put(BUCKET_META, META_HEAD_KEY.to_vec(), bincode::serialize(head)?);
        }
        writes.extend(extra);

        self.persistence.write(writes)?;

        for id in &batch.spent {
            state.remove(id);
        }
        for ux in batch.created {
            state.insert(ux);
        }
        state.refresh_root();
        if batch.head.is_some() {
            state.head = batch.head;
        }

        debug!(
            spent = batch.spent.len(),
            outputs = state.outputs.len(),
            "unspent batch applied"
        );
        Ok(())
    }
}

/// Read guard over the unspent set.
pub struct UnspentSnapshot<'a> {
    guard: RwLockReadGuard<'a, UnspentState>,
}

impl UnspentSnapshot<'_> {
    pub fn head(&self) -> Option<ChainHead> {
        self.guard.head
    }

    pub fn root(&self) -> Sha256Hash {
        self.guard.root
    }

    pub fn len(&self) -> usize {
        self.guard.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.outputs.is_empty()
    }
}

impl UtxoView for UnspentSnapshot<'_> {
    fn get(&self, id: &Sha256Hash) -> Option<UxOut> {
        self.guard.outputs.get(id).cloned()
    }

    fn has(&self, id: &Sha256Hash) -> bool {
        self.guard.outputs.contains_key(id)
    }
}

/// Staged changes layered over a base view.
///
/// Outputs created here are visible to later lookups. Spending one of them
/// cancels its creation instead of recording a spend of the base.
pub struct WorkingView<'a, V: UtxoView + ?Sized> {
    base: &'a V,
    created: HashMap<Sha256Hash, UxOut>,
    order: Vec<Sha256Hash>,
    spent: BTreeSet<Sha256Hash>,
}

impl<'a, V: UtxoView + ?Sized> WorkingView<'a, V> {
    pub fn new(base: &'a V) -> Self {
        WorkingView {
            base,
            created: HashMap::new(),
            order: Vec::new(),
            spent: BTreeSet::new(),
        }
    }

    pub fn spend(&mut self, id: &Sha256Hash) {
        if self.created.remove(id).is_some() {
            self.order.retain(|o| o != id);
        } else {
            self.spent.insert(*id);
        }
    }

    pub fn create(&mut self, ux: UxOut) {
        let id = ux.id();
        if self.created.insert(id, ux).is_none() {
            self.order.push(id);
        }
    }

    /// Net effect of everything staged, created outputs in creation order.
    pub fn into_batch(mut self, head: Option<ChainHead>) -> UtxoBatch {
        let created = self
            .order
            .iter()
            .filter_map(|id| self.created.remove(id))
            .collect();
        UtxoBatch {
            spent: self.spent,
            created,
            head,
        }
    }
}

impl<V: UtxoView + ?Sized> UtxoView for WorkingView<'_, V> {
    fn get(&self, id: &Sha256Hash) -> Option<UxOut> {
        if self.spent.contains(id) {
            return None;
        }
        if let Some(ux) = self.created.get(id) {
            return Some(ux.clone());
        }
        self.base.get(id)
    }
}
