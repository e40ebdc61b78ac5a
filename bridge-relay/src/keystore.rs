//! In-memory key custody.

use std::collections::HashMap;

use k256::ecdsa::SigningKey;
use parking_lot::RwLock;

use crate::{
    crypto::{BridgeSignature, ValidatorPubKey},
    error::RelayError,
    message::UpdateDigest,
    signer::KeyCustody,
};

struct StoredKey {
    key: SigningKey,
    unlocked: bool,
}

/// Holds secp256k1 validator keys in memory. Keys are locked when inserted and must be unlocked
/// before they can sign.
#[derive(Default)]
pub struct MemoryKeystore {
    keys: RwLock<HashMap<ValidatorPubKey, StoredKey>>,
}

impl MemoryKeystore {
    pub fn new() -> MemoryKeystore {
        MemoryKeystore::default()
    }

    pub fn insert(&self, key: SigningKey) -> ValidatorPubKey {
        let pubkey = ValidatorPubKey::from_secp256k1(key.verifying_key());
        self.keys.write().insert(
            pubkey.clone(),
            StoredKey {
                key,
                unlocked: false,
            },
        );
        pubkey
    }

    pub fn unlock(&self, pubkey: &ValidatorPubKey) -> Result<(), RelayError> {
        self.set_unlocked(pubkey, true)
    }

    pub fn lock(&self, pubkey: &ValidatorPubKey) -> Result<(), RelayError> {
        self.set_unlocked(pubkey, false)
    }

    pub fn is_unlocked(&self, pubkey: &ValidatorPubKey) -> bool {
        self.keys
            .read()
            .get(pubkey)
            .is_some_and(|stored| stored.unlocked)
    }

    fn set_unlocked(&self, pubkey: &ValidatorPubKey, unlocked: bool) -> Result<(), RelayError> {
        let mut keys = self.keys.write();
        let stored = keys
            .get_mut(pubkey)
            .ok_or_else(|| RelayError::KeyUnavailable(format!("unknown key {pubkey}")))?;
        stored.unlocked = unlocked;
        Ok(())
    }
}

impl KeyCustody for MemoryKeystore {
    fn sign_digest(
        &self,
        pubkey: &ValidatorPubKey,
        digest: &UpdateDigest,
    ) -> Result<BridgeSignature, RelayError> {
        let keys = self.keys.read();
        let stored = keys
            .get(pubkey)
            .ok_or_else(|| RelayError::KeyUnavailable(format!("unknown key {pubkey}")))?;
        if !stored.unlocked {
            return Err(RelayError::KeyUnavailable(format!("key {pubkey} is locked")));
        }

        let (signature, recovery_id) = stored
            .key
            .sign_prehash_recoverable(digest.as_slice())
            .map_err(|e| RelayError::KeyUnavailable(format!("signing failed: {e}")))?;

        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&signature.to_bytes());
        bytes[64] = recovery_id.to_byte();
        Ok(BridgeSignature::new(bytes))
    }
}
