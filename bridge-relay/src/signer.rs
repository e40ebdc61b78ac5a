//! Signing of update digests with a validator's bridge key.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    crypto::{BridgeSignature, PubKeyType, REGISTRY_V_OFFSET, ValidatorPubKey},
    error::RelayError,
    message::UpdateDigest,
};

/// Access to validator keys held by an external custody layer (an encrypted keystore, an HSM, a
/// remote signer).
///
/// Implementations must be safe to call concurrently, since a single process may run relays for
/// several validator identities against the same custody backend. A call may have side effects
/// (unlocking hardware, audit logs) and is never retried by the relay.
pub trait KeyCustody: Send + Sync {
    /// Signs a 32-byte pre-hashed `digest` with the key identified by `pubkey`, returning
    /// `[R | S | V]` where `V` is the raw recovery id (0 or 1).
    ///
    /// Fails with [RelayError::KeyUnavailable] if the key is unknown or locked.
    fn sign_digest(
        &self,
        pubkey: &ValidatorPubKey,
        digest: &UpdateDigest,
    ) -> Result<BridgeSignature, RelayError>;
}

/// Convention for the final byte of a [BridgeSignature].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningMode {
    /// `V` is the raw recovery id, 0 or 1. For signatures which are only checked inside the
    /// protocol.
    Raw,
    /// `V` is 27 or 28, so the signature can be passed straight to `ecrecover` by the bridge
    /// registry contract.
    #[default]
    Registry,
}

#[derive(Clone)]
pub struct BridgeSigner {
    custody: Arc<dyn KeyCustody>,
}

impl BridgeSigner {
    pub fn new(custody: Arc<dyn KeyCustody>) -> BridgeSigner {
        BridgeSigner { custody }
    }

    /// Produces a signature in `[R | S]` format.
    pub fn sign(
        &self,
        pubkey: &ValidatorPubKey,
        digest: &UpdateDigest,
    ) -> Result<[u8; 64], RelayError> {
        Ok(self.sign_with_mode(pubkey, digest, SigningMode::Raw)?.rs())
    }

    /// Produces a signature in `[R | S | V]` format where `V` is 27 or 28.
    pub fn sign_for_registry(
        &self,
        pubkey: &ValidatorPubKey,
        digest: &UpdateDigest,
    ) -> Result<BridgeSignature, RelayError> {
        self.sign_with_mode(pubkey, digest, SigningMode::Registry)
    }

    pub fn sign_with_mode(
        &self,
        pubkey: &ValidatorPubKey,
        digest: &UpdateDigest,
        mode: SigningMode,
    ) -> Result<BridgeSignature, RelayError> {
        if pubkey.key_type() != PubKeyType::Secp256k1 {
            return Err(RelayError::UnsupportedKeyType(pubkey.key_type()));
        }
        let signature = self.custody.sign_digest(pubkey, digest)?;
        let mut bytes = *signature.as_bytes();
        match (mode, bytes[64]) {
            (SigningMode::Raw, 0 | 1) => {}
            (SigningMode::Registry, v @ (0 | 1)) => bytes[64] = v + REGISTRY_V_OFFSET,
            (_, v) => {
                return Err(RelayError::InvalidSignature(format!(
                    "key custody returned recovery byte {v}"
                )));
            }
        }
        Ok(BridgeSignature::new(bytes))
    }
}
