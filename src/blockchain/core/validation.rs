use crate::blockchain::core::chain::{Block, BlockAuthority, BlockHeader};
use crate::blockchain::core::state::{ChainHead, UtxoBatch, UtxoView, UxOut, WorkingView};
use crate::coin;
use crate::distribution::LockPolicy;
use crate::error::{ChainError, Result};
use crate::transaction::{Transaction, VerifiedTx, VerifyParams};
use tracing::warn;

pub fn validate_authority(block: &Block, authority: &dyn BlockAuthority) -> Result<()> {
    if !authority.verify(&block.hash(), &block.signature) {
        return Err(ChainError::UnauthorizedBlock(format!(
            "signature on block {} ({}) does not verify against the authority key",
            block.header.seq,
            hex::encode(block.hash())
        )));
    }
    Ok(())
}

pub fn validate_linkage(head: &ChainHead, header: &BlockHeader) -> Result<()> {
    if header.seq != head.seq + 1 {
        return Err(ChainError::ChainDiscontinuity(format!(
            "expected block {}, got {}",
            head.seq + 1,
            header.seq
        )));
    }
    if header.prev_hash != head.hash {
        return Err(ChainError::ChainDiscontinuity(format!(
            "block {} links to {}, head is {}",
            header.seq,
            hex::encode(header.prev_hash),
            hex::encode(head.hash)
        )));
    }
    if header.time <= head.time {
        return Err(ChainError::NonMonotonicTimestamp {
            head: head.time,
            block: header.time,
        });
    }
    Ok(())
}

pub fn validate_body_size(block: &Block, max_block_transactions_size: usize) -> Result<()> {
    if block.transactions.is_empty() {
        return Err(ChainError::InvalidBlock(format!(
            "block {} has no transactions",
            block.header.seq
        )));
    }
    let size = block.body_size()?;
    if size > max_block_transactions_size {
        return Err(ChainError::InvalidBlock(format!(
            "block {} body is {} bytes (max: {})",
            block.header.seq, size, max_block_transactions_size
        )));
    }
    Ok(())
}

pub fn validate_body_hash(block: &Block) -> Result<()> {
    let actual = Block::calculate_body_hash(&block.transactions);
    if actual != block.header.body_hash {
        return Err(ChainError::BodyHashMismatch {
            expected: block.header.body_hash,
            actual,
        });
    }
    Ok(())
}

pub fn validate_fee(header: &BlockHeader, actual: u64) -> Result<()> {
    if header.fee != actual {
        return Err(ChainError::FeeMismatch {
            declared: header.fee,
            actual,
        });
    }
    Ok(())
}

/// Verifies `tx` against `view` and, if it passes, stages its spends and
/// created outputs there. On error `view` is left untouched.
pub fn stage_transaction<V: UtxoView + ?Sized>(
    view: &mut WorkingView<'_, V>,
    tx: &Transaction,
    seq: u64,
    time: u64,
    policy: &LockPolicy,
    params: &VerifyParams,
) -> Result<VerifiedTx> {
    let verified = tx.verify(&*view, policy, time, params)?;
    if tx.outputs.len() > usize::from(u16::MAX) + 1 {
        return Err(ChainError::InvalidBlock(format!(
            "transaction {} has too many outputs",
            verified.tx.hash_str()
        )));
    }

    for input in &tx.inputs {
        view.spend(input);
    }
    for (index, output) in (0..=u16::MAX).zip(&tx.outputs) {
        view.create(UxOut {
            src_transaction: verified.txid,
            output_index: index,
            address: output.address,
            coins: output.coins,
            hours: output.hours,
            block_seq: seq,
            head_time: time,
        });
    }
    Ok(verified)
}

/// Verifies `transactions` in order on top of `base` and collects their net
/// effect. Outputs created by an earlier transaction are spendable by a later
/// one; spending the same output twice fails with `UnknownInput`.
///
/// Returns the staged batch (without a head) and the total hours burned.
pub fn stage_transactions<V: UtxoView + ?Sized>(
    transactions: &[Transaction],
    base: &V,
    seq: u64,
    time: u64,
    policy: &LockPolicy,
    params: &VerifyParams,
) -> Result<(UtxoBatch, u64)> {
    let mut view = WorkingView::new(base);
    let mut fee = 0u64;

    for (i, tx) in transactions.iter().enumerate() {
        let verified = stage_transaction(&mut view, tx, seq, time, policy, params).map_err(|e| {
            warn!(seq, index = i, txid = %tx.hash_str(), error = %e, "block transaction rejected");
            e
        })?;
        fee = coin::add(fee, verified.fee, "block fee")?;
    }

    Ok((view.into_batch(None), fee))
}
