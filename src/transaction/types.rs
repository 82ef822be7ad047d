//! Transaction types for the fibercoin ledger
use crate::blockchain::Sha256Hash;
use crate::coin;
use crate::crypto::{add_sha256, Address, KeyPair, Signature};
use crate::error::{ChainError, VerificationError};
use bincode::Options;
use sha2::{Digest, Sha256};

/// A payment to one address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TransactionOutput {
    pub address: Address,
    /// Droplets.
    pub coins: u64,
    pub hours: u64,
}

impl TransactionOutput {
    pub fn new(address: Address, coins: u64, hours: u64) -> Self {
        TransactionOutput {
            address,
            coins,
            hours,
        }
    }
}

/// Spends unspent outputs and creates new ones. One signature per input.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub inputs: Vec<Sha256Hash>,
    pub outputs: Vec<TransactionOutput>,
    pub signatures: Vec<Signature>,
}

impl Transaction {
    /// Unsigned transaction.
    pub fn new(inputs: Vec<Sha256Hash>, outputs: Vec<TransactionOutput>) -> Self {
        Transaction {
            inputs,
            outputs,
            signatures: Vec::new(),
        }
    }

    /// Hash of inputs and outputs, excluding signatures.
    pub fn inner_hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update((self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            hasher.update(input);
        }
        hasher.update((self.outputs.len() as u64).to_le_bytes());
        for output in &self.outputs {
            hasher.update(output.address.bytes());
            hasher.update(output.coins.to_le_bytes());
            hasher.update(output.hours.to_le_bytes());
        }
        hasher.finalize().into()
    }

    /// Digest signed by the owner of input `index`.
    pub fn signing_digest(&self, index: usize) -> Option<Sha256Hash> {
        let input = self.inputs.get(index)?;
        Some(add_sha256(&self.inner_hash(), input))
    }

    /// Transaction id: commits to the whole transaction, signatures included.
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.inner_hash());
        hasher.update((self.signatures.len() as u64).to_le_bytes());
        for sig in &self.signatures {
            hasher.update(sig.as_bytes());
        }
        hasher.finalize().into()
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash())
    }

    /// Signs every input, `keys[i]` for `inputs[i]`. Replaces existing signatures.
    pub fn sign_inputs(&mut self, keys: &[&KeyPair]) -> Result<(), ChainError> {
        if keys.len() != self.inputs.len() {
            return Err(ChainError::CryptoError(format!(
                "{} keys for {} inputs",
                keys.len(),
                self.inputs.len()
            )));
        }
        let inner = self.inner_hash();
        self.signatures = self
            .inputs
            .iter()
            .zip(keys)
            .map(|(input, key)| key.sign_digest(&add_sha256(&inner, input)))
            .collect();
        Ok(())
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> Result<usize, VerificationError> {
        bincode::serialized_size(self)
            .map(|n| n as usize)
            .map_err(|e| VerificationError::Serialization(e.to_string()))
    }

    pub fn validate_size(&self, max: usize) -> Result<(), VerificationError> {
        let size = self.size()?;
        if size > max {
            return Err(VerificationError::TooLarge { size, max });
        }
        Ok(())
    }

    pub fn output_coins(&self) -> Result<u64, VerificationError> {
        coin::sum(self.outputs.iter().map(|o| o.coins), "output coins")
    }

    pub fn output_hours(&self) -> Result<u64, VerificationError> {
        coin::sum(self.outputs.iter().map(|o| o.hours), "output hours")
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChainError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes exactly one transaction; leftover bytes are an error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        Ok(bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .reject_trailing_bytes()
            .deserialize(bytes)?)
    }

    /// Hex of the bincode encoding, as accepted by the node API.
    pub fn to_hex(&self) -> Result<String, ChainError> {
        Ok(hex::encode(self.to_bytes()?))
    }

    pub fn from_hex(raw: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(raw.trim())
            .map_err(|e| ChainError::BincodeError(format!("invalid transaction hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify_address_signature;

    fn sample(keys: &[&KeyPair]) -> Transaction {
        let inputs = (0..keys.len() as u8).map(|i| [i + 1; 32]).collect();
        let outputs = vec![TransactionOutput::new(KeyPair::generate().address(), 1_000_000, 5)];
        let mut tx = Transaction::new(inputs, outputs);
        tx.sign_inputs(keys).unwrap();
        tx
    }

    #[test]
    fn test_signatures_verify_per_input() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let tx = sample(&[&a, &b]);

        let d0 = tx.signing_digest(0).unwrap();
        let d1 = tx.signing_digest(1).unwrap();
        assert_ne!(d0, d1);
        assert!(verify_address_signature(&a.address(), &d0, &tx.signatures[0]).is_ok());
        assert!(verify_address_signature(&b.address(), &d1, &tx.signatures[1]).is_ok());
        assert!(verify_address_signature(&a.address(), &d1, &tx.signatures[1]).is_err());
        assert!(tx.signing_digest(2).is_none());
    }

    #[test]
    fn test_inner_hash_ignores_signatures_but_txid_does_not() {
        let a = KeyPair::generate();
        let tx = sample(&[&a]);
        let mut unsigned = tx.clone();
        unsigned.signatures.clear();

        assert_eq!(tx.inner_hash(), unsigned.inner_hash());
        assert_ne!(tx.hash(), unsigned.hash());
    }

    #[test]
    fn test_hex_roundtrip_preserves_txid() {
        let a = KeyPair::generate();
        let tx = sample(&[&a]);
        let decoded = Transaction::from_hex(&tx.to_hex().unwrap()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.hash(), tx.hash());
        assert!(Transaction::from_hex("zz").is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let a = KeyPair::generate();
        let tx = sample(&[&a]);
        let mut bytes = tx.to_bytes().unwrap();
        assert_eq!(Transaction::from_bytes(&bytes).unwrap(), tx);

        bytes.push(0);
        assert!(Transaction::from_bytes(&bytes).is_err());
        let padded = format!("{}00", tx.to_hex().unwrap());
        assert!(Transaction::from_hex(&padded).is_err());
    }

    #[test]
    fn test_sign_requires_one_key_per_input() {
        let a = KeyPair::generate();
        let mut tx = Transaction::new(vec![[1; 32], [2; 32]], vec![]);
        assert!(tx.sign_inputs(&[&a]).is_err());
    }

    #[test]
    fn test_validate_size() {
        let a = KeyPair::generate();
        let tx = sample(&[&a]);
        let size = tx.size().unwrap();
        assert!(tx.validate_size(size).is_ok());
        assert_eq!(
            tx.validate_size(size - 1).unwrap_err(),
            VerificationError::TooLarge {
                size,
                max: size - 1
            }
        );
    }
}
