//! Sources of chain head notifications.
//!
//! A [HeadFeed] hands out [HeadSubscription]s, each of which carries two queues: the heads
//! themselves and the errors reported by the underlying transport. The producing side of a
//! subscription is a [HeadPublisher]; dropping the [HeadSubscription] unsubscribes and stops any
//! forwarding task behind it.

use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use async_trait::async_trait;
use tokio::{
    select,
    sync::{
        broadcast::{self, error::RecvError},
        mpsc,
    },
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    error::{RelayError, SubscriptionError},
    message::ChainHeader,
};

#[async_trait]
pub trait HeadFeed: Send + Sync {
    /// Opens a new subscription to this feed's heads. Fails if the subscription cannot be
    /// established.
    async fn subscribe(&self) -> Result<HeadSubscription, RelayError>;
}

/// A head feed for a chain we connect to over the network, which can be asked for its identity.
#[async_trait]
pub trait RemoteChain: HeadFeed {
    async fn chain_id(&self) -> Result<u64, RelayError>;
}

/// Creates a connected publisher/subscription pair. At most `buffer` heads are queued before
/// [HeadPublisher::publish] waits for the subscriber.
pub fn head_channel(buffer: usize) -> (HeadPublisher, HeadSubscription) {
    let (heads_sender, heads) = mpsc::channel(buffer.max(1));
    let (errors_sender, errors) = mpsc::unbounded_channel();
    (
        HeadPublisher {
            heads: heads_sender,
            errors: errors_sender,
        },
        HeadSubscription {
            heads,
            errors,
            task: None,
        },
    )
}

#[derive(Debug, Clone)]
pub struct HeadPublisher {
    heads: mpsc::Sender<ChainHeader>,
    errors: mpsc::UnboundedSender<SubscriptionError>,
}

impl HeadPublisher {
    /// Fails with [SubscriptionError::Closed] once the subscriber has gone away.
    pub async fn publish(&self, header: ChainHeader) -> Result<(), SubscriptionError> {
        self.heads
            .send(header)
            .await
            .map_err(|_| SubscriptionError::Closed)
    }

    /// Reports an error to the subscriber. Returns `false` if the subscriber has gone away.
    pub fn fail(&self, error: SubscriptionError) -> bool {
        self.errors.send(error).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.heads.is_closed()
    }
}

#[derive(Debug)]
pub struct HeadSubscription {
    heads: mpsc::Receiver<ChainHeader>,
    errors: mpsc::UnboundedReceiver<SubscriptionError>,
    task: Option<JoinHandle<()>>,
}

impl HeadSubscription {
    /// Ties a forwarding task to this subscription. The task is aborted when the subscription is
    /// dropped.
    pub fn with_task(mut self, task: JoinHandle<()>) -> HeadSubscription {
        self.task = Some(task);
        self
    }

    /// Waits for the next head or error. Cancel safe.
    pub async fn next(&mut self) -> Result<ChainHeader, SubscriptionError> {
        select! {
            // Heads queued before a failure are still delivered.
            biased;
            head = self.heads.recv() => head.ok_or(SubscriptionError::Closed),
            Some(error) = self.errors.recv() => Err(error),
        }
    }
}

impl Drop for HeadSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Local chain heads, published by the node as it commits blocks.
#[derive(Debug, Clone)]
pub struct LocalChainHeads {
    sender: broadcast::Sender<ChainHeader>,
    head_buffer: usize,
}

impl LocalChainHeads {
    pub fn new(head_buffer: usize) -> LocalChainHeads {
        let (sender, _) = broadcast::channel(head_buffer.max(1));
        LocalChainHeads {
            sender,
            head_buffer,
        }
    }

    /// Announces a new local head. Returns the number of subscriptions it was delivered to.
    pub fn notify(&self, header: ChainHeader) -> usize {
        self.sender.send(header).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl HeadFeed for LocalChainHeads {
    async fn subscribe(&self) -> Result<HeadSubscription, RelayError> {
        let mut receiver = self.sender.subscribe();
        let (publisher, subscription) = head_channel(self.head_buffer);
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(header) => {
                        if publisher.publish(header).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        publisher.fail(SubscriptionError::Lagged(skipped));
                    }
                    Err(RecvError::Closed) => {
                        publisher.fail(SubscriptionError::Closed);
                        break;
                    }
                }
            }
        });
        Ok(subscription.with_task(task))
    }
}

/// A websocket connection to an EVM chain node.
#[derive(Clone)]
pub struct ChainClient {
    rpc_url: String,
    provider: DynProvider,
    head_buffer: usize,
}

impl ChainClient {
    /// Connects to `rpc_url`, which must be a `ws://` or `wss://` URL to support subscriptions.
    pub async fn connect(rpc_url: &str, head_buffer: usize) -> Result<ChainClient, RelayError> {
        let ws = WsConnect::new(rpc_url);
        let provider = ProviderBuilder::new()
            .on_ws(ws)
            .await
            .map_err(|e| RelayError::Connection(format!("{rpc_url}: {e}")))?
            .erased();

        Ok(ChainClient {
            rpc_url: rpc_url.to_owned(),
            provider,
            head_buffer,
        })
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }
}

#[async_trait]
impl HeadFeed for ChainClient {
    async fn subscribe(&self) -> Result<HeadSubscription, RelayError> {
        let mut blocks = self
            .provider
            .subscribe_blocks()
            .await
            .map_err(|e| RelayError::Connection(format!("{}: {e}", self.rpc_url)))?;
        let (publisher, subscription) = head_channel(self.head_buffer);
        let rpc_url = self.rpc_url.clone();
        let task = tokio::spawn(async move {
            loop {
                match blocks.recv().await {
                    Ok(header) => {
                        let head = ChainHeader::new(header.inner.number, header.inner.state_root);
                        if publisher.publish(head).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        publisher.fail(SubscriptionError::Lagged(skipped));
                    }
                    Err(RecvError::Closed) => {
                        debug!(%rpc_url, "new heads subscription closed");
                        publisher.fail(SubscriptionError::Closed);
                        break;
                    }
                }
            }
        });
        Ok(subscription.with_task(task))
    }
}

#[async_trait]
impl RemoteChain for ChainClient {
    async fn chain_id(&self) -> Result<u64, RelayError> {
        self.provider
            .get_chain_id()
            .await
            .map_err(|e| RelayError::Connection(format!("{}: {e}", self.rpc_url)))
    }
}
