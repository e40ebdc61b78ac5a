//! Merges the local and remote head subscriptions into a single stream of events.

use std::sync::Arc;

use tokio::select;
use tracing::info;

use crate::{
    error::{RelayError, SubscriptionError},
    feed::{HeadFeed, HeadSubscription, RemoteChain},
    message::{ChainHeader, Origin},
};

/// The two head feeds a relay watches.
#[derive(Clone)]
pub struct Feeds {
    pub local: Arc<dyn HeadFeed>,
    pub remote: Arc<dyn RemoteChain>,
}

impl Feeds {
    pub fn new(local: Arc<dyn HeadFeed>, remote: Arc<dyn RemoteChain>) -> Feeds {
        Feeds { local, remote }
    }

    pub async fn subscribe(&self, origin: Origin) -> Result<HeadSubscription, RelayError> {
        match origin {
            Origin::Local => self.local.subscribe().await,
            Origin::Remote => self.remote.subscribe().await,
        }
    }

    /// Checks the remote chain is the network we expect to be attesting to. Digests are scoped by
    /// chain id, so connecting to the wrong network would produce votes nobody else agrees with.
    pub async fn check_remote_chain_id(&self, expected: u64) -> Result<(), RelayError> {
        let actual = self.remote.chain_id().await?;
        if actual != expected {
            return Err(RelayError::ChainIdMismatch { expected, actual });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Unstarted,
    Subscribing,
    Active,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    Head(Origin, ChainHeader),
    SubscriptionFailed(Origin, SubscriptionError),
}

/// Watches the heads of both chains.
///
/// A terminal error on one origin's subscription drops that subscription only; the other origin
/// keeps producing heads. The watcher never resubscribes by itself - a replacement subscription
/// can be handed in with [ChainHeadWatcher::install].
pub struct ChainHeadWatcher {
    feeds: Feeds,
    expected_remote_chain_id: u64,
    state: WatcherState,
    subscriptions: [Option<HeadSubscription>; 2],
}

impl ChainHeadWatcher {
    pub fn new(feeds: Feeds, expected_remote_chain_id: u64) -> ChainHeadWatcher {
        ChainHeadWatcher {
            feeds,
            expected_remote_chain_id,
            state: WatcherState::Unstarted,
            subscriptions: [None, None],
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn feeds(&self) -> &Feeds {
        &self.feeds
    }

    pub fn is_live(&self, origin: Origin) -> bool {
        self.subscriptions[origin.index()].is_some()
    }

    /// Verifies the remote chain id and subscribes to both origins. On failure nothing stays
    /// subscribed and the watcher is stopped.
    pub async fn start(&mut self) -> Result<(), RelayError> {
        if self.state != WatcherState::Unstarted {
            return Err(RelayError::AlreadyStarted);
        }
        self.state = WatcherState::Subscribing;

        match self.subscribe_all().await {
            Ok([local, remote]) => {
                self.subscriptions = [Some(local), Some(remote)];
                self.state = WatcherState::Active;
                info!(
                    remote_chain_id = self.expected_remote_chain_id,
                    "watching local and remote chain heads"
                );
                Ok(())
            }
            Err(e) => {
                self.state = WatcherState::Stopped;
                Err(e)
            }
        }
    }

    async fn subscribe_all(&self) -> Result<[HeadSubscription; 2], RelayError> {
        self.feeds
            .check_remote_chain_id(self.expected_remote_chain_id)
            .await?;
        let local = self.feeds.subscribe(Origin::Local).await?;
        let remote = self.feeds.subscribe(Origin::Remote).await?;
        Ok([local, remote])
    }

    /// Replaces the subscription of `origin`. Ignored unless the watcher is active.
    pub fn install(&mut self, origin: Origin, subscription: HeadSubscription) -> bool {
        if self.state != WatcherState::Active {
            return false;
        }
        self.subscriptions[origin.index()] = Some(subscription);
        true
    }

    /// Waits for the next event from either origin, in arrival order. Pends forever if neither
    /// origin has a live subscription. Cancel safe.
    pub async fn next(&mut self) -> WatcherEvent {
        let [local, remote] = &mut self.subscriptions;
        let (origin, result) = select! {
            result = next_from(local) => (Origin::Local, result),
            result = next_from(remote) => (Origin::Remote, result),
        };

        match result {
            Ok(header) => WatcherEvent::Head(origin, header),
            Err(error) => {
                if error.is_terminal() {
                    self.subscriptions[origin.index()] = None;
                }
                WatcherEvent::SubscriptionFailed(origin, error)
            }
        }
    }

    /// Unsubscribes from both origins.
    pub fn stop(&mut self) {
        self.subscriptions = [None, None];
        self.state = WatcherState::Stopped;
    }
}

async fn next_from(
    subscription: &mut Option<HeadSubscription>,
) -> Result<ChainHeader, SubscriptionError> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}
