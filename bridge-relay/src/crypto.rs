//! Validator key handles and bridge signatures.
//!
//! The relay never touches private key material directly. Validators are identified by a
//! [ValidatorPubKey] handle, which is passed to the key custody layer (see [crate::signer]) to
//! obtain signatures. This module also contains the fixed 65-byte [BridgeSignature] wire format
//! and the logic to recover the signing address from it.

use std::fmt::{self, Debug, Display, Formatter};

use alloy::primitives::Address;
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey};
use serde::{
    Deserialize, Serialize,
    de::{self, Unexpected},
};
use sha3::{Digest, Keccak256};

use crate::{error::RelayError, message::UpdateDigest};

/// Offset added to the raw recovery id when producing signatures for the bridge registry
/// contract, as per the Ethereum `ecrecover` convention.
pub const REGISTRY_V_OFFSET: u8 = 27;

/// The curve family of a validator key. Encoded as the first byte of a serialized
/// [ValidatorPubKey].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PubKeyType {
    Secp256k1,
    Other(u8),
}

impl PubKeyType {
    const SECP256K1_TAG: u8 = 0xc0;

    pub fn from_byte(tag: u8) -> PubKeyType {
        match tag {
            Self::SECP256K1_TAG => PubKeyType::Secp256k1,
            other => PubKeyType::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            PubKeyType::Secp256k1 => Self::SECP256K1_TAG,
            PubKeyType::Other(tag) => tag,
        }
    }
}

/// A handle identifying a validator's bridge key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ValidatorPubKey {
    key_type: PubKeyType,
    raw: Vec<u8>,
}

impl ValidatorPubKey {
    pub fn new(key_type: PubKeyType, raw: Vec<u8>) -> ValidatorPubKey {
        ValidatorPubKey { key_type, raw }
    }

    /// Builds a handle from a secp256k1 key, in uncompressed SEC1 form.
    pub fn from_secp256k1(key: &VerifyingKey) -> ValidatorPubKey {
        ValidatorPubKey {
            key_type: PubKeyType::Secp256k1,
            raw: key.to_encoded_point(false).as_bytes().to_vec(),
        }
    }

    /// Parses `[type | raw key]`.
    pub fn from_bytes(bytes: &[u8]) -> Result<ValidatorPubKey, RelayError> {
        match bytes.split_first() {
            Some((tag, raw)) if !raw.is_empty() => Ok(ValidatorPubKey {
                key_type: PubKeyType::from_byte(*tag),
                raw: raw.to_vec(),
            }),
            _ => Err(RelayError::Encoding(format!(
                "validator public key too short: {} bytes",
                bytes.len()
            ))),
        }
    }

    pub fn from_hex(s: &str) -> Result<ValidatorPubKey, RelayError> {
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))
            .map_err(|e| RelayError::Encoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.raw.len() + 1);
        bytes.push(self.key_type.to_byte());
        bytes.extend_from_slice(&self.raw);
        bytes
    }

    pub fn key_type(&self) -> PubKeyType {
        self.key_type
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The account address controlled by this key. Only defined for secp256k1 keys.
    pub fn address(&self) -> Result<Address, RelayError> {
        if self.key_type != PubKeyType::Secp256k1 {
            return Err(RelayError::UnsupportedKeyType(self.key_type));
        }
        let key = VerifyingKey::from_sec1_bytes(&self.raw)
            .map_err(|e| RelayError::Encoding(format!("invalid secp256k1 key: {e}")))?;
        Ok(secp256k1_address(&key))
    }
}

impl Display for ValidatorPubKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_bytes()))
    }
}

impl Debug for ValidatorPubKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

pub fn secp256k1_address(key: &VerifyingKey) -> Address {
    // Remove the first byte before hashing - The first byte specifies the encoding tag.
    let point = key.to_encoded_point(false);
    Address::from_slice(&Keccak256::digest(&point.as_bytes()[1..])[12..32])
}

/// A recoverable ECDSA signature in `[R(32) | S(32) | V(1)]` layout.
///
/// `V` is either the raw recovery id (0 or 1), or the registry convention (27 or 28). Which one
/// is used depends on the [crate::signer::SigningMode] the signature was produced with.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BridgeSignature([u8; 65]);

impl BridgeSignature {
    pub const LEN: usize = 65;

    pub fn new(bytes: [u8; 65]) -> BridgeSignature {
        BridgeSignature(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<BridgeSignature, RelayError> {
        let bytes: [u8; 65] = bytes.try_into().map_err(|_| {
            RelayError::InvalidSignature(format!("expected 65 bytes, got {}", bytes.len()))
        })?;
        Ok(BridgeSignature(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    /// The `[R | S]` part of the signature.
    pub fn rs(&self) -> [u8; 64] {
        let mut rs = [0; 64];
        rs.copy_from_slice(&self.0[..64]);
        rs
    }

    pub fn v(&self) -> u8 {
        self.0[64]
    }

    /// The raw recovery id, regardless of which `V` convention this signature uses.
    pub fn recovery_id(&self) -> Result<u8, RelayError> {
        match self.v() {
            v @ (0 | 1) => Ok(v),
            v @ (27 | 28) => Ok(v - REGISTRY_V_OFFSET),
            v => Err(RelayError::InvalidSignature(format!(
                "invalid recovery byte {v}"
            ))),
        }
    }

    /// Recovers the address of the key which produced this signature over `digest`.
    pub fn recover_signer(&self, digest: &UpdateDigest) -> Result<Address, RelayError> {
        let signature = EcdsaSignature::from_slice(&self.0[..64])
            .map_err(|e| RelayError::InvalidSignature(e.to_string()))?;
        let recovery_id = RecoveryId::from_byte(self.recovery_id()?)
            .ok_or_else(|| RelayError::InvalidSignature("invalid recovery id".to_owned()))?;
        let key = VerifyingKey::recover_from_prehash(digest.as_slice(), &signature, recovery_id)
            .map_err(|e| RelayError::InvalidSignature(e.to_string()))?;
        Ok(secp256k1_address(&key))
    }
}

impl Display for BridgeSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Debug for BridgeSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Serialize for BridgeSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BridgeSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s))
            .ok()
            .and_then(|bytes| BridgeSignature::from_bytes(&bytes).ok())
            .ok_or_else(|| de::Error::invalid_value(Unexpected::Str(&s), &"a 65 byte signature"))
    }
}
