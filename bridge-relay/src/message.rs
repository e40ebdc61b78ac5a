use std::fmt::{self, Debug, Display, Formatter};

use alloy::primitives::{Address, B256, U256, ruint::UintTryFrom};
use serde::{Deserialize, Serialize};

use crate::{crypto::BridgeSignature, error::RelayError};

/// Which of the two watched chains a head was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    pub const ALL: [Origin; 2] = [Origin::Local, Origin::Remote];

    pub(crate) fn index(self) -> usize {
        match self {
            Origin::Local => 0,
            Origin::Remote => 1,
        }
    }
}

impl Display for Origin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local => f.write_str("local"),
            Origin::Remote => f.write_str("remote"),
        }
    }
}

/// The part of a block header the relay attests to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHeader {
    pub block_number: U256,
    pub state_root: B256,
}

impl ChainHeader {
    /// Panics if `block_number` does not fit in 256 bits, which no primitive integer can exceed.
    pub fn new<T>(block_number: T, state_root: B256) -> ChainHeader
    where
        U256: UintTryFrom<T>,
    {
        ChainHeader {
            block_number: U256::from(block_number),
            state_root,
        }
    }
}

/// A member of a validator set and its voting weight. The order of entries in a validator set
/// delta is significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatorEntry {
    pub address: Address,
    pub weight: U256,
}

impl ValidatorEntry {
    pub fn new(address: Address, weight: U256) -> ValidatorEntry {
        ValidatorEntry { address, weight }
    }

    /// Builds an entry from untyped big-endian byte strings, as found in contract logs or
    /// registry dumps. Values which do not fit their declared width are rejected rather than
    /// truncated.
    pub fn try_from_slices(address: &[u8], weight: &[u8]) -> Result<ValidatorEntry, RelayError> {
        if address.len() != 20 {
            return Err(RelayError::Encoding(format!(
                "validator address must be 20 bytes, got {}",
                address.len()
            )));
        }
        let weight = U256::try_from_be_slice(weight).ok_or_else(|| {
            RelayError::Encoding(format!(
                "validator weight does not fit in 256 bits ({} bytes)",
                weight.len()
            ))
        })?;
        Ok(ValidatorEntry {
            address: Address::from_slice(address),
            weight,
        })
    }
}

/// The canonical hash of an observed chain state. This is the value validators sign.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateDigest(pub B256);

impl UpdateDigest {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl Display for UpdateDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for UpdateDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validator's signed attestation of a chain head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeVote {
    pub block_num: u64,
    pub chain_id: u64,
    pub hash: UpdateDigest,
    pub signature: BridgeSignature,
}
