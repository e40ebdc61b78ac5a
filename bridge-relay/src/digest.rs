//! Canonical update digests.
//!
//! The digest is `keccak256(abi.encode(uint256 blockNum, bytes32 stateRoot, uint256 chainId,
//! (address,uint256)[] newValidators))`. It must match the decoding performed by the bridge
//! registry contract bit for bit, otherwise validators' votes will never reach quorum. Any change
//! to the field order, widths or tuple shape is a protocol change and needs a coordinated upgrade.

use alloy::{
    primitives::{B256, U256, keccak256},
    sol,
    sol_types::SolValue,
};

use crate::message::{UpdateDigest, ValidatorEntry};

sol! {
    /// Element of the validator set delta, as declared by the registry contract.
    struct RegistryValidator {
        address addr;
        uint256 weight;
    }
}

impl From<&ValidatorEntry> for RegistryValidator {
    fn from(entry: &ValidatorEntry) -> Self {
        RegistryValidator {
            addr: entry.address,
            weight: entry.weight,
        }
    }
}

/// The ABI encoded pre-image of an update digest.
///
/// The validator delta is always encoded, even when empty, so "no validator change" is distinct
/// from a missing field.
pub fn encode_update(
    block_number: U256,
    state_root: B256,
    chain_id: U256,
    validator_delta: &[ValidatorEntry],
) -> Vec<u8> {
    let validators: Vec<RegistryValidator> = validator_delta.iter().map(Into::into).collect();
    (block_number, state_root, chain_id, validators).abi_encode_params()
}

pub fn build_digest(
    block_number: U256,
    state_root: B256,
    chain_id: U256,
    validator_delta: &[ValidatorEntry],
) -> UpdateDigest {
    UpdateDigest(keccak256(encode_update(
        block_number,
        state_root,
        chain_id,
        validator_delta,
    )))
}
