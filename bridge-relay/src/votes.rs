//! The two boundaries between the relay and the consensus engine: outbound votes flow into a
//! [VoteSink], votes gossiped by peers flow back in through a [VoteSource].

use std::collections::BTreeMap;

use alloy::primitives::Address;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::{
    crypto::BridgeSignature,
    error::RelayError,
    message::{BridgeVote, UpdateDigest},
};

/// Receives votes produced by the relay. `submit` must not block; the receiver decides on its own
/// schedule whether to carry the vote. A vote that is never carried is simply superseded by the
/// vote for the next head.
pub trait VoteSink: Send + Sync {
    fn submit(&self, vote: BridgeVote);
}

impl VoteSink for UnboundedSender<BridgeVote> {
    fn submit(&self, vote: BridgeVote) {
        if self.send(vote).is_err() {
            trace!(chain_id = vote.chain_id, "vote receiver has gone away");
        }
    }
}

/// Holds the most recent vote for each chain until the event emitter collects them.
#[derive(Debug, Default)]
pub struct PendingVotes {
    votes: Mutex<BTreeMap<u64, BridgeVote>>,
}

impl PendingVotes {
    pub fn new() -> PendingVotes {
        PendingVotes::default()
    }

    /// Removes and returns the current votes, ordered by chain id.
    pub fn take_votes(&self) -> Vec<BridgeVote> {
        std::mem::take(&mut *self.votes.lock())
            .into_values()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.votes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.lock().is_empty()
    }
}

impl VoteSink for PendingVotes {
    fn submit(&self, vote: BridgeVote) {
        let mut votes = self.votes.lock();
        match votes.get(&vote.chain_id) {
            // An older head never replaces a newer one.
            Some(existing) if existing.block_num > vote.block_num => {}
            _ => {
                votes.insert(vote.chain_id, vote);
            }
        }
    }
}

/// Creates a vote source and the queue its batches arrive on.
pub fn vote_channel() -> (VoteSource, UnboundedReceiver<Vec<BridgeVote>>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (VoteSource { sender }, receiver)
}

/// Handle through which the gossip layer delivers batches of votes received from peers.
#[derive(Debug, Clone)]
pub struct VoteSource {
    sender: UnboundedSender<Vec<BridgeVote>>,
}

impl VoteSource {
    /// Queues a batch for the relay. Never blocks, whatever the size of the batch. Returns `false`
    /// if the relay has been dropped.
    pub fn on_votes_received(&self, votes: Vec<BridgeVote>) -> bool {
        if votes.is_empty() {
            return !self.sender.is_closed();
        }
        self.sender.send(votes).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VoteKey {
    pub chain_id: u64,
    pub block_num: u64,
    pub hash: UpdateDigest,
}

impl VoteKey {
    pub fn of(vote: &BridgeVote) -> VoteKey {
        VoteKey {
            chain_id: vote.chain_id,
            block_num: vote.block_num,
            hash: vote.hash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    New(Address),
    Duplicate(Address),
    /// The vote is for a block which has already been pruned.
    Stale,
    /// The vote is for a block too far beyond the newest head this relay has seen itself.
    Ahead,
    /// The vote is for a chain this relay does not watch.
    UnwatchedChain,
    /// There is no room for another block, digest or signer.
    Full,
}

/// Distinct digests held for a single block. Honest peers only disagree about a block during a
/// reorg, so anything beyond this is noise.
const MAX_DIGESTS_PER_BLOCK: usize = 8;
/// Distinct signers held for a single digest.
const MAX_SIGNERS_PER_DIGEST: usize = 4096;

type Signers = BTreeMap<Address, BridgeSignature>;

#[derive(Debug, Default)]
struct ChainVotes {
    /// The newest head of this chain observed by the relay itself.
    head: Option<u64>,
    blocks: BTreeMap<u64, BTreeMap<UpdateDigest, Signers>>,
}

impl ChainVotes {
    fn signers(&self, block_num: u64, hash: &UpdateDigest) -> Option<&Signers> {
        self.blocks.get(&block_num)?.get(hash)
    }
}

/// Signatures received from peers, by chain, block and digest.
///
/// Peers may disagree about the digest for a block, so each digest has its own set of signers.
/// Only the chains the relay watches are tracked. The window of blocks held for a chain is
/// anchored on the heads the relay observes itself, never on block numbers claimed by peers:
/// votes more than `retention` blocks behind or ahead of the newest observed head are refused.
/// Until the first head of a chain has been observed, at most `2 * retention + 1` blocks are held
/// and the lowest are preferred.
#[derive(Debug)]
pub struct VoteBook {
    retention: u64,
    chains: BTreeMap<u64, ChainVotes>,
}

impl VoteBook {
    pub fn new(retention: u64, chain_ids: impl IntoIterator<Item = u64>) -> VoteBook {
        VoteBook {
            retention,
            chains: chain_ids
                .into_iter()
                .map(|chain_id| (chain_id, ChainVotes::default()))
                .collect(),
        }
    }

    fn max_blocks(&self) -> usize {
        usize::try_from(self.retention.saturating_mul(2).saturating_add(1)).unwrap_or(usize::MAX)
    }

    /// Moves the window of `chain_id` forward to a head observed by the relay, pruning votes
    /// which fall outside it. Older heads are ignored.
    pub fn observe_head(&mut self, chain_id: u64, block_num: u64) {
        let retention = self.retention;
        let Some(chain) = self.chains.get_mut(&chain_id) else {
            return;
        };
        if chain.head.is_some_and(|head| head >= block_num) {
            return;
        }
        chain.head = Some(block_num);
        let oldest = block_num.saturating_sub(retention);
        let newest = block_num.saturating_add(retention);
        chain
            .blocks
            .retain(|block, _| (oldest..=newest).contains(block));
    }

    /// Recovers the signer of `vote` and records its signature. Fails if the signature does not
    /// recover to a valid key.
    pub fn record(&mut self, vote: &BridgeVote) -> Result<Recorded, RelayError> {
        let retention = self.retention;
        let max_blocks = self.max_blocks();
        let Some(chain) = self.chains.get_mut(&vote.chain_id) else {
            return Ok(Recorded::UnwatchedChain);
        };

        // Gossip redelivers votes, skip recovery for ones we have already seen.
        let seen = chain
            .signers(vote.block_num, &vote.hash)
            .and_then(|signers| {
                signers
                    .iter()
                    .find(|(_, signature)| **signature == vote.signature)
                    .map(|(signer, _)| *signer)
            });
        if let Some(signer) = seen {
            return Ok(Recorded::Duplicate(signer));
        }

        if let Some(head) = chain.head {
            if vote.block_num.saturating_add(retention) < head {
                return Ok(Recorded::Stale);
            }
            if vote.block_num > head.saturating_add(retention) {
                return Ok(Recorded::Ahead);
            }
        }

        let signer = vote.signature.recover_signer(&vote.hash)?;

        match chain.blocks.get(&vote.block_num) {
            Some(digests) => match digests.get(&vote.hash) {
                Some(signers) if signers.contains_key(&signer) => {
                    return Ok(Recorded::Duplicate(signer));
                }
                Some(signers) if signers.len() >= MAX_SIGNERS_PER_DIGEST => {
                    return Ok(Recorded::Full);
                }
                Some(_) => {}
                None if digests.len() >= MAX_DIGESTS_PER_BLOCK => return Ok(Recorded::Full),
                None => {}
            },
            None if chain.blocks.len() >= max_blocks => {
                // Only reachable before the first head: make room by dropping the highest block,
                // unless this vote would itself be the highest.
                match chain.blocks.last_key_value() {
                    Some((&highest, _)) if highest > vote.block_num => {
                        chain.blocks.pop_last();
                    }
                    _ => return Ok(Recorded::Full),
                }
            }
            None => {}
        }

        chain
            .blocks
            .entry(vote.block_num)
            .or_default()
            .entry(vote.hash)
            .or_default()
            .insert(signer, vote.signature);
        Ok(Recorded::New(signer))
    }

    fn signers(&self, key: &VoteKey) -> Option<&Signers> {
        self.chains
            .get(&key.chain_id)?
            .signers(key.block_num, &key.hash)
    }

    /// The addresses which signed `key`, in ascending order.
    pub fn signers_for(&self, key: &VoteKey) -> Vec<Address> {
        self.signers(key)
            .map(|signers| signers.keys().copied().collect())
            .unwrap_or_default()
    }

    /// The signatures over `key`, ordered by signer address as the registry contract expects.
    pub fn signatures_for(&self, key: &VoteKey) -> Vec<BridgeSignature> {
        self.signers(key)
            .map(|signers| signers.values().copied().collect())
            .unwrap_or_default()
    }

    /// The newest block of `chain_id` with votes held.
    pub fn newest_block(&self, chain_id: u64) -> Option<u64> {
        self.chains
            .get(&chain_id)?
            .blocks
            .last_key_value()
            .map(|(block, _)| *block)
    }

    /// The newest head of `chain_id` observed by the relay itself.
    pub fn head(&self, chain_id: u64) -> Option<u64> {
        self.chains.get(&chain_id)?.head
    }

    /// The number of distinct (chain, block, digest) entries held.
    pub fn len(&self) -> usize {
        self.chains
            .values()
            .flat_map(|chain| chain.blocks.values())
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
