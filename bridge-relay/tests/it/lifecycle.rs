use std::{sync::Arc, time::Duration};

use bridge_relay::{
    cfg::ResubscribePolicy,
    error::{RelayError, SubscriptionError},
    message::Origin,
    relay::Relay,
    watcher::Feeds,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::{
    Harness, LOCAL_CHAIN_ID, REMOTE_CHAIN_ID, ScriptedFeed, Validator, config, eventually,
};

#[tokio::test]
async fn wrong_remote_chain_is_rejected_before_subscribing() {
    let local = ScriptedFeed::new(LOCAL_CHAIN_ID);
    let remote = ScriptedFeed::new(5);
    let validator = Validator::random(&mut ChaCha8Rng::seed_from_u64(10));
    let (sink, _votes) = mpsc::unbounded_channel();

    let result = Relay::new(
        config(),
        Feeds::new(local.clone(), remote.clone()),
        validator.signer.clone(),
        validator.pubkey.clone(),
        Arc::new(sink),
    )
    .await;

    assert_eq!(
        result.err(),
        Some(RelayError::ChainIdMismatch {
            expected: REMOTE_CHAIN_ID,
            actual: 5
        })
    );
    assert_eq!(local.subscribe_calls(), 0);
    assert_eq!(remote.subscribe_calls(), 0);
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let mut harness = Harness::new(11).await;
    harness.relay.start().await.unwrap();
    assert_eq!(harness.relay.start().await, Err(RelayError::AlreadyStarted));
    assert_eq!(harness.local.subscriptions(), 1);
    assert_eq!(harness.remote.subscriptions(), 1);
    harness.relay.stop().await;
}

#[tokio::test]
async fn failed_start_can_be_retried() {
    let mut harness = Harness::new(12).await;
    harness.remote.refuse_next(1);

    assert!(matches!(
        harness.relay.start().await,
        Err(RelayError::Connection(_))
    ));
    assert!(!harness.relay.is_running());
    // The local subscription opened before the failure has been dropped again.
    assert!(harness.local.publisher().is_closed());

    harness.relay.start().await.unwrap();
    assert!(harness.relay.is_running());
    let header = harness.random_header(1);
    harness.remote.publisher().publish(header).await.unwrap();
    assert_eq!(harness.next_vote().await.chain_id, REMOTE_CHAIN_ID);
    harness.relay.stop().await;
}

#[tokio::test]
async fn no_votes_after_stop() {
    let mut harness = Harness::new(13).await;
    harness.relay.start().await.unwrap();

    let local = harness.local.publisher();
    let remote = harness.remote.publisher();
    for block in 0..30 {
        let header = harness.random_header(block);
        local.publish(header).await.unwrap();
        remote.publish(header).await.unwrap();
    }
    harness.relay.stop().await;
    assert!(!harness.relay.is_running());

    let mut delivered = Vec::new();
    while let Ok(vote) = harness.votes.try_recv() {
        delivered.push(vote);
    }
    // Heads are handled in order and each handled head produced exactly one vote, so the votes
    // delivered per chain are blocks 0 up to the last head seen before stopping.
    for (origin, chain_id) in [
        (Origin::Local, LOCAL_CHAIN_ID),
        (Origin::Remote, REMOTE_CHAIN_ID),
    ] {
        let blocks: Vec<u64> = delivered
            .iter()
            .filter(|vote| vote.chain_id == chain_id)
            .map(|vote| vote.block_num)
            .collect();
        let handled = harness
            .relay
            .last_seen(origin)
            .map_or(0, |header| header.block_number.to::<u64>() + 1);
        assert_eq!(blocks, (0..handled).collect::<Vec<_>>());
    }

    // Both subscriptions are gone, so nothing buffered can be handled later.
    assert!(local.is_closed());
    assert!(remote.is_closed());
    assert!(local.publish(harness.random_header(30)).await.is_err());
    assert_eq!(harness.votes.try_recv(), Err(TryRecvError::Empty));

    // Stopping again is harmless.
    harness.relay.stop().await;
}

#[tokio::test]
async fn restart_opens_fresh_subscriptions() {
    let mut harness = Harness::new(14).await;
    harness.relay.start().await.unwrap();
    let header = harness.random_header(5);
    harness.local.publisher().publish(header).await.unwrap();
    harness.next_vote().await;
    harness.relay.stop().await;
    assert_eq!(harness.relay.last_seen(Origin::Local), Some(header));

    harness.relay.start().await.unwrap();
    assert_eq!(harness.local.subscriptions(), 2);
    assert_eq!(harness.remote.subscriptions(), 2);
    assert_eq!(harness.relay.last_seen(Origin::Local), None);

    let header = harness.random_header(6);
    harness.local.publisher().publish(header).await.unwrap();
    assert_eq!(harness.next_vote().await.block_num, 6);
    harness.relay.stop().await;
}

#[tokio::test]
async fn never_resubscribe_leaves_origin_dead() {
    let mut harness = Harness::with_config(15, |config| {
        config.resubscribe = ResubscribePolicy::Never;
    })
    .await;
    harness.relay.start().await.unwrap();

    let remote = harness.remote.publisher();
    remote.fail(SubscriptionError::Closed);
    eventually(|| remote.is_closed()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.remote.subscribe_calls(), 1);

    // The local chain is unaffected.
    let header = harness.random_header(8);
    harness.local.publisher().publish(header).await.unwrap();
    assert_eq!(harness.next_vote().await.chain_id, LOCAL_CHAIN_ID);
    assert!(harness.relay.is_running());
    harness.relay.stop().await;
}

#[tokio::test]
async fn resubscription_gives_up_after_max_attempts() {
    let mut harness = Harness::with_config(16, |config| {
        config.resubscribe = ResubscribePolicy::Backoff {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            max_attempts: Some(3),
        };
    })
    .await;
    harness.relay.start().await.unwrap();

    harness.remote.refuse_next(usize::MAX);
    harness.remote.publisher().fail(SubscriptionError::Closed);
    let remote = harness.remote.clone();
    eventually(|| remote.subscribe_calls() == 4).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.remote.subscribe_calls(), 4);
    assert_eq!(harness.remote.subscriptions(), 1);
    // The local chain is still watched.
    assert!(harness.relay.is_running());
    harness.relay.stop().await;
}

#[tokio::test]
async fn session_ends_when_both_chains_are_lost() {
    let mut harness = Harness::with_config(18, |config| {
        config.resubscribe = ResubscribePolicy::Never;
    })
    .await;
    harness.relay.start().await.unwrap();

    harness.local.publisher().fail(SubscriptionError::Closed);
    harness.remote.publisher().fail(SubscriptionError::Closed);
    eventually(|| !harness.relay.is_running()).await;
    assert!(harness.local.publisher().is_closed());
    assert!(harness.remote.publisher().is_closed());

    // A new session can be started after the old one ended by itself.
    harness.relay.start().await.unwrap();
    assert!(harness.relay.is_running());
    let header = harness.random_header(2);
    harness.remote.publisher().publish(header).await.unwrap();
    assert_eq!(harness.next_vote().await.chain_id, REMOTE_CHAIN_ID);
    harness.relay.stop().await;
}

#[tokio::test]
async fn session_ends_when_resubscription_gives_up_on_both_chains() {
    let mut harness = Harness::with_config(19, |config| {
        config.resubscribe = ResubscribePolicy::Backoff {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            max_attempts: Some(2),
        };
    })
    .await;
    harness.relay.start().await.unwrap();

    harness.local.refuse_next(usize::MAX);
    harness.remote.refuse_next(usize::MAX);
    harness.local.publisher().fail(SubscriptionError::Closed);
    harness.remote.publisher().fail(SubscriptionError::Closed);
    eventually(|| !harness.relay.is_running()).await;
    assert_eq!(harness.local.subscribe_calls(), 3);
    assert_eq!(harness.remote.subscribe_calls(), 3);

    harness.local.refuse_next(0);
    harness.remote.refuse_next(0);
    harness.relay.start().await.unwrap();
    assert!(harness.relay.is_running());
    harness.relay.stop().await;
}

#[tokio::test]
async fn stop_cancels_pending_resubscription() {
    let mut harness = Harness::with_config(17, |config| {
        config.resubscribe = ResubscribePolicy::Backoff {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(200),
            max_attempts: None,
        };
    })
    .await;
    harness.relay.start().await.unwrap();

    let local = harness.local.publisher();
    local.fail(SubscriptionError::Closed);
    eventually(|| local.is_closed()).await;
    harness.relay.stop().await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.local.subscribe_calls(), 1);
}
