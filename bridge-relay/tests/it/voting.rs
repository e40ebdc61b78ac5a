use std::sync::Arc;

use alloy::primitives::{B256, U256, keccak256};
use bridge_relay::{
    digest::build_digest,
    error::SubscriptionError,
    message::{ChainHeader, Origin},
    relay::Relay,
    signer::SigningMode,
    votes::PendingVotes,
    watcher::Feeds,
};

use crate::{Harness, LOCAL_CHAIN_ID, REMOTE_CHAIN_ID, ScriptedFeed, config, eventually};

#[tokio::test]
async fn local_head_produces_registry_vote() {
    let mut harness = Harness::new(1).await;
    harness.relay.start().await.unwrap();

    let state_root = B256::repeat_byte(0xaa);
    harness
        .local
        .publisher()
        .publish(ChainHeader::new(100u64, state_root))
        .await
        .unwrap();
    let vote = harness.next_vote().await;

    let mut preimage = Vec::new();
    preimage.extend_from_slice(&U256::from(100).to_be_bytes::<32>());
    preimage.extend_from_slice(state_root.as_slice());
    preimage.extend_from_slice(&U256::from(250).to_be_bytes::<32>());
    preimage.extend_from_slice(&U256::from(0x80).to_be_bytes::<32>());
    preimage.extend_from_slice(&U256::ZERO.to_be_bytes::<32>());

    assert_eq!(vote.block_num, 100);
    assert_eq!(vote.chain_id, LOCAL_CHAIN_ID);
    assert_eq!(vote.hash.0, keccak256(&preimage));
    assert!(matches!(vote.signature.v(), 27 | 28));
    assert_eq!(
        vote.signature.recover_signer(&vote.hash).unwrap(),
        harness.validator.pubkey.address().unwrap()
    );
    assert_eq!(
        harness.relay.last_seen(Origin::Local),
        Some(ChainHeader::new(100u64, state_root))
    );

    harness.relay.stop().await;
}

#[tokio::test]
async fn remote_votes_continue_while_local_is_down() {
    let mut harness = Harness::new(2).await;
    harness.relay.start().await.unwrap();
    let dead_local = harness.local.publisher();

    // Keep the local feed down for the first resubscription attempts.
    harness.local.refuse_next(2);
    dead_local.fail(SubscriptionError::Closed);
    eventually(|| dead_local.is_closed()).await;

    let header = harness.random_header(7);
    harness.remote.publisher().publish(header).await.unwrap();
    let vote = harness.next_vote().await;
    assert_eq!(vote.chain_id, REMOTE_CHAIN_ID);
    assert_eq!(
        vote.hash,
        build_digest(
            U256::from(7),
            header.state_root,
            U256::from(REMOTE_CHAIN_ID),
            &[]
        )
    );

    // Nothing from the local chain until it has been resubscribed.
    assert!(dead_local.publish(harness.random_header(8)).await.is_err());
    harness.assert_no_vote().await;

    let local = harness.local.clone();
    eventually(|| local.subscriptions() == 2).await;
    assert_eq!(harness.local.subscribe_calls(), 4);

    let header = harness.random_header(9);
    harness.local.publisher().publish(header).await.unwrap();
    let vote = harness.next_vote().await;
    assert_eq!((vote.chain_id, vote.block_num), (LOCAL_CHAIN_ID, 9));

    harness.relay.stop().await;
}

#[tokio::test]
async fn lagging_subscription_keeps_voting() {
    let mut harness = Harness::new(3).await;
    harness.relay.start().await.unwrap();

    let publisher = harness.remote.publisher();
    publisher.fail(SubscriptionError::Lagged(12));
    publisher.fail(SubscriptionError::Transport("connection reset".to_owned()));
    let header = harness.random_header(40);
    publisher.publish(header).await.unwrap();

    assert_eq!(harness.next_vote().await.block_num, 40);
    // Non-terminal errors do not cause a resubscription.
    assert_eq!(harness.remote.subscriptions(), 1);

    harness.relay.stop().await;
}

#[tokio::test]
async fn signing_failure_skips_one_head() {
    let mut harness = Harness::new(4).await;
    harness.relay.start().await.unwrap();
    let calls = harness.validator.custody.calls();
    harness.validator.custody.fail_next(1);

    let publisher = harness.local.publisher();
    let first = harness.random_header(1);
    let second = harness.random_header(2);
    publisher.publish(first).await.unwrap();
    publisher.publish(second).await.unwrap();

    let vote = harness.next_vote().await;
    assert_eq!(vote.block_num, 2);
    assert_eq!(
        vote.hash,
        build_digest(
            U256::from(2),
            second.state_root,
            U256::from(LOCAL_CHAIN_ID),
            &[]
        )
    );
    assert_eq!(harness.validator.custody.calls(), calls + 2);
    harness.assert_no_vote().await;
    assert!(harness.relay.is_running());

    harness.relay.stop().await;
}

#[tokio::test]
async fn raw_signing_mode() {
    let mut harness = Harness::with_config(5, |config| config.signing_mode = SigningMode::Raw).await;
    harness.relay.start().await.unwrap();

    let header = harness.random_header(3);
    harness.remote.publisher().publish(header).await.unwrap();
    let vote = harness.next_vote().await;
    assert!(vote.signature.v() <= 1);
    let registry = harness
        .validator
        .signer
        .sign_for_registry(&harness.validator.pubkey, &vote.hash)
        .unwrap();
    assert_eq!(registry.rs(), vote.signature.rs());
    assert_eq!(registry.v(), vote.signature.v() + 27);

    harness.relay.stop().await;
}

#[tokio::test]
async fn pending_votes_hold_latest_per_chain() {
    let mut harness = Harness::new(6).await;
    let local = ScriptedFeed::new(LOCAL_CHAIN_ID);
    let remote = ScriptedFeed::new(REMOTE_CHAIN_ID);
    let pending = Arc::new(PendingVotes::new());
    let mut relay = Relay::new(
        config(),
        Feeds::new(local.clone(), remote.clone()),
        harness.validator.signer.clone(),
        harness.validator.pubkey.clone(),
        pending.clone(),
    )
    .await
    .unwrap();
    relay.start().await.unwrap();

    let mut latest_local = None;
    for block in 1..=3 {
        let header = harness.random_header(block);
        local.publisher().publish(header).await.unwrap();
        latest_local = Some(header);
    }
    let latest_remote = harness.random_header(10);
    remote.publisher().publish(latest_remote).await.unwrap();

    eventually(|| {
        relay.last_seen(Origin::Local) == latest_local
            && relay.last_seen(Origin::Remote) == Some(latest_remote)
    })
    .await;
    let votes = pending.take_votes();
    assert_eq!(votes.len(), 2);
    assert_eq!((votes[0].chain_id, votes[0].block_num), (REMOTE_CHAIN_ID, 10));
    assert_eq!((votes[1].chain_id, votes[1].block_num), (LOCAL_CHAIN_ID, 3));
    assert!(pending.is_empty());

    relay.stop().await;
}
