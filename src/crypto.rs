//! Cryptographic primitives for fibercoin

use crate::blockchain::Sha256Hash;
use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use secp256k1::{
    constants::{PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::{self, RecoverableSignature, RecoveryId},
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Length of a recoverable signature: 64 compact bytes plus the recovery id.
pub const SIGNATURE_SIZE: usize = 65;

/// Only address version currently issued.
pub const ADDRESS_VERSION: u8 = 0;

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> Sha256Hash {
    Sha256::digest(data).into()
}

/// SHA-256 of two hashes concatenated.
pub fn add_sha256(a: &Sha256Hash, b: &Sha256Hash) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// Parses a 64-character hex string into a hash.
pub fn hash_from_hex(hex_str: &str) -> Result<Sha256Hash, ChainError> {
    let mut hash = [0u8; 32];
    hex::decode_to_slice(hex_str, &mut hash)
        .map_err(|e| ChainError::CryptoError(format!("Invalid hex hash: {}", e)))?;
    Ok(hash)
}

/// Account identifier: `RIPEMD160(SHA256(SHA256(pubkey)))` plus a version byte.
///
/// The textual form is base58 of `key || version || checksum`, where the
/// checksum is the first four bytes of `SHA256(key || version)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub version: u8,
    pub key: [u8; 20],
}

impl Address {
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let pubkey_bytes: [u8; PUBLIC_KEY_SIZE] = public_key.serialize();
        let inner = Sha256::digest(Sha256::digest(pubkey_bytes));
        let mut key = [0u8; 20];
        key.copy_from_slice(&Ripemd160::digest(inner));
        Address {
            version: ADDRESS_VERSION,
            key,
        }
    }

    /// `key || version`, the bytes committed to by hashes and checksums.
    pub fn bytes(&self) -> [u8; 21] {
        let mut out = [0u8; 21];
        out[..20].copy_from_slice(&self.key);
        out[20] = self.version;
        out
    }

    pub fn checksum(&self) -> [u8; 4] {
        let digest = sha256(&self.bytes());
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&digest[..4]);
        checksum
    }

    pub fn is_null(&self) -> bool {
        self.key == [0u8; 20]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut raw = Vec::with_capacity(25);
        raw.extend_from_slice(&self.bytes());
        raw.extend_from_slice(&self.checksum());
        write!(f, "{}", bs58::encode(raw).into_string())
    }
}

impl FromStr for Address {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = bs58::decode(s)
            .into_vec()
            .map_err(|e| ChainError::InvalidAddress(format!("{}: {}", s, e)))?;
        if raw.len() != 25 {
            return Err(ChainError::InvalidAddress(format!(
                "{}: decoded to {} bytes, expected 25",
                s,
                raw.len()
            )));
        }

        let mut key = [0u8; 20];
        key.copy_from_slice(&raw[..20]);
        let address = Address {
            version: raw[20],
            key,
        };
        if address.version != ADDRESS_VERSION {
            return Err(ChainError::InvalidAddress(format!(
                "{}: unsupported version {}",
                s, address.version
            )));
        }
        if address.checksum() != raw[21..25] {
            return Err(ChainError::InvalidAddress(format!("{}: bad checksum", s)));
        }
        Ok(address)
    }
}

// Base58 text for JSON and TOML, the raw 21 bytes for bincode.
impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.bytes())
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            return s.parse().map_err(serde::de::Error::custom);
        }
        let buf = serde_bytes::ByteBuf::deserialize(deserializer)?;
        if buf.len() != 21 {
            return Err(serde::de::Error::invalid_length(buf.len(), &"21 address bytes"));
        }
        if buf[20] != ADDRESS_VERSION {
            return Err(serde::de::Error::custom(format!(
                "unsupported address version {}",
                buf[20]
            )));
        }
        let mut key = [0u8; 20];
        key.copy_from_slice(&buf[..20]);
        Ok(Address {
            version: buf[20],
            key,
        })
    }
}

/// Recoverable secp256k1 signature over a 32-byte digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; SIGNATURE_SIZE]);

impl Signature {
    pub const NULL: Signature = Signature([0u8; SIGNATURE_SIZE]);

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, ChainError> {
        let mut bytes = [0u8; SIGNATURE_SIZE];
        hex::decode_to_slice(hex_str, &mut bytes)
            .map_err(|e| ChainError::CryptoError(format!("Invalid hex signature: {}", e)))?;
        Ok(Signature(bytes))
    }

    /// Signatures must carry a low S value; `(r, n - s)` with the flipped
    /// recovery id would otherwise recover the same key.
    fn to_recoverable(self) -> Result<RecoverableSignature, ChainError> {
        let standard = ecdsa::Signature::from_compact(&self.0[..64])
            .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;
        let mut normalized = standard;
        normalized.normalize_s();
        if normalized != standard {
            return Err(ChainError::CryptoError(
                "Invalid signature: non-canonical high S value".to_string(),
            ));
        }

        let recovery_id = RecoveryId::from_i32(i32::from(self.0[64]))
            .map_err(|e| ChainError::CryptoError(format!("Invalid recovery id: {}", e)))?;
        RecoverableSignature::from_compact(&self.0[..64], recovery_id)
            .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let buf = serde_bytes::ByteBuf::deserialize(deserializer)?;
        let bytes: [u8; SIGNATURE_SIZE] = buf.as_slice().try_into().map_err(|_| {
            serde::de::Error::invalid_length(buf.len(), &"a 65-byte recoverable signature")
        })?;
        Ok(Signature(bytes))
    }
}

/// Parses a compressed public key from hex.
pub fn public_key_from_hex(hex_str: &str) -> Result<PublicKey, ChainError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| ChainError::CryptoError(format!("Invalid hex public key: {}", e)))?;
    PublicKey::from_slice(&bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    /// Creates a KeyPair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;

        Ok(Self::from_secret_key(secret_key))
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key)
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    /// Signs a 32-byte digest, producing a signature the signer's public key
    /// can be recovered from.
    pub fn sign_digest(&self, digest: &Sha256Hash) -> Signature {
        let message = Message::from_digest(*digest);
        let signature = SECP256K1_CONTEXT.sign_ecdsa_recoverable(&message, &self.secret_key);
        let (recovery_id, compact) = signature.serialize_compact();

        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes[..64].copy_from_slice(&compact);
        bytes[64] = recovery_id.to_i32() as u8;
        Signature(bytes)
    }
}

/// Recovers the public key that produced `signature` over `digest`.
pub fn recover_public_key(digest: &Sha256Hash, signature: &Signature) -> Result<PublicKey, ChainError> {
    let message = Message::from_digest(*digest);
    let recoverable = signature.to_recoverable()?;
    SECP256K1_CONTEXT
        .recover_ecdsa(&message, &recoverable)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}

/// Checks that `signature` over `digest` was produced by `public_key`.
pub fn verify_pubkey_signature(
    public_key: &PublicKey,
    digest: &Sha256Hash,
    signature: &Signature,
) -> Result<(), ChainError> {
    let recovered = recover_public_key(digest, signature)?;
    if recovered != *public_key {
        return Err(ChainError::CryptoError(
            "Signature verification failed".to_string(),
        ));
    }
    Ok(())
}

/// Checks that `signature` over `digest` was produced by the key behind `address`.
pub fn verify_address_signature(
    address: &Address,
    digest: &Sha256Hash,
    signature: &Signature,
) -> Result<(), ChainError> {
    let recovered = recover_public_key(digest, signature)?;
    if Address::from_public_key(&recovered) != *address {
        return Err(ChainError::CryptoError(
            "Signature verification failed".to_string(),
        ));
    }
    Ok(())
}

/// Rewrites `sig` as `(r, n - s)` with the opposite recovery id.
#[cfg(test)]
pub(crate) fn high_s_twin(sig: &Signature) -> Signature {
    use secp256k1::constants::CURVE_ORDER;

    let mut out = *sig;
    let mut borrow = 0i16;
    for i in (0..32).rev() {
        let mut d = i16::from(CURVE_ORDER[i]) - i16::from(sig.0[32 + i]) - borrow;
        borrow = if d < 0 {
            d += 256;
            1
        } else {
            0
        };
        out.0[32 + i] = d as u8;
    }
    out.0[64] ^= 1;
    out
}
