//! The relay supervisor.
//!
//! A [Relay] owns at most one running session. The session is a single worker task which takes
//! events one at a time from the [ChainHeadWatcher], the inbound vote queue and any pending
//! resubscriptions, and turns every observed head into a signed [BridgeVote] for the [VoteSink].
//! Failures while handling a single head are logged and never end the session.

use std::{sync::Arc, time::Instant};

use alloy::primitives::U256;
use parking_lot::{Mutex, MutexGuard};
use tokio::{
    select,
    sync::{mpsc::UnboundedReceiver, watch},
    task::{JoinError, JoinHandle, JoinSet},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    cfg::{RelayConfig, ResubscribePolicy},
    crypto::ValidatorPubKey,
    digest::build_digest,
    error::{RelayError, SubscriptionError},
    feed::{ChainClient, HeadFeed, HeadSubscription, RemoteChain},
    message::{BridgeVote, ChainHeader, Origin, ValidatorEntry},
    ratelimit::LogThrottle,
    signer::BridgeSigner,
    votes::{Recorded, VoteBook, VoteSink, VoteSource, vote_channel},
    watcher::{ChainHeadWatcher, Feeds, WatcherEvent},
};

/// Supplies the validator set delta to include in the digest of a head.
pub trait ValidatorDeltaSource: Send + Sync {
    fn validator_delta(&self, origin: Origin, header: &ChainHeader) -> Vec<ValidatorEntry>;
}

/// Every head is attested to with an empty validator set delta.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoValidatorChange;

impl ValidatorDeltaSource for NoValidatorChange {
    fn validator_delta(&self, _: Origin, _: &ChainHeader) -> Vec<ValidatorEntry> {
        Vec::new()
    }
}

type LastSeen = Arc<Mutex<[Option<ChainHeader>; 2]>>;

pub struct Relay {
    config: RelayConfig,
    feeds: Feeds,
    signer: BridgeSigner,
    pubkey: ValidatorPubKey,
    sink: Arc<dyn VoteSink>,
    validator_delta: Arc<dyn ValidatorDeltaSource>,
    vote_source: VoteSource,
    /// Held here while no session is running; the worker owns it otherwise.
    inbound: Option<UnboundedReceiver<Vec<BridgeVote>>>,
    last_seen: LastSeen,
    vote_book: Arc<Mutex<VoteBook>>,
    session: Option<RelaySession>,
}

struct RelaySession {
    stop: watch::Sender<bool>,
    worker: JoinHandle<UnboundedReceiver<Vec<BridgeVote>>>,
}

impl Relay {
    /// Creates a relay, checking that the remote chain reports the configured chain id. No
    /// subscription is opened until [Relay::start].
    pub async fn new(
        config: RelayConfig,
        feeds: Feeds,
        signer: BridgeSigner,
        pubkey: ValidatorPubKey,
        sink: Arc<dyn VoteSink>,
    ) -> Result<Relay, RelayError> {
        feeds.check_remote_chain_id(config.remote.chain_id).await?;

        let (vote_source, inbound) = vote_channel();
        let vote_book = VoteBook::new(
            config.vote_retention_blocks,
            [config.local.chain_id, config.remote.chain_id],
        );
        Ok(Relay {
            config,
            feeds,
            signer,
            pubkey,
            sink,
            validator_delta: Arc::new(NoValidatorChange),
            vote_source,
            inbound: Some(inbound),
            last_seen: Arc::new(Mutex::new([None, None])),
            vote_book: Arc::new(Mutex::new(vote_book)),
            session: None,
        })
    }

    /// Connects to the remote chain at the configured websocket endpoint and creates a relay
    /// which watches it alongside `local`.
    pub async fn connect(
        config: RelayConfig,
        local: Arc<dyn HeadFeed>,
        signer: BridgeSigner,
        pubkey: ValidatorPubKey,
        sink: Arc<dyn VoteSink>,
    ) -> Result<Relay, RelayError> {
        let remote: Arc<dyn RemoteChain> =
            Arc::new(ChainClient::connect(&config.remote.rpc_url, config.head_buffer).await?);
        Relay::new(config, Feeds::new(local, remote), signer, pubkey, sink).await
    }

    pub fn with_validator_delta(mut self, source: Arc<dyn ValidatorDeltaSource>) -> Relay {
        self.validator_delta = source;
        self
    }

    /// Subscribes to both chains and starts the session worker. Returns once both subscriptions
    /// are live.
    pub async fn start(&mut self) -> Result<(), RelayError> {
        if self.is_running() {
            return Err(RelayError::AlreadyStarted);
        }
        // Reaps a session which ended by itself.
        self.stop().await;
        let Some(inbound) = self.inbound.take() else {
            return Err(RelayError::AlreadyStarted);
        };

        let mut watcher = ChainHeadWatcher::new(self.feeds.clone(), self.config.remote.chain_id);
        if let Err(e) = watcher.start().await {
            self.inbound = Some(inbound);
            return Err(e);
        }
        *self.last_seen.lock() = [None, None];

        let (stop, stop_receiver) = watch::channel(false);
        let worker = Worker {
            config: self.config.clone(),
            watcher,
            signer: self.signer.clone(),
            pubkey: self.pubkey.clone(),
            sink: self.sink.clone(),
            validator_delta: self.validator_delta.clone(),
            inbound,
            last_seen: self.last_seen.clone(),
            vote_book: self.vote_book.clone(),
            throttle: LogThrottle::periodic(self.config.log_interval),
            resubscriptions: JoinSet::new(),
        };
        let worker = tokio::spawn(worker.run(stop_receiver));
        self.session = Some(RelaySession { stop, worker });

        info!(
            local_chain_id = self.config.local.chain_id,
            remote_chain_id = self.config.remote.chain_id,
            "relay started"
        );
        Ok(())
    }

    /// Stops the session worker and unsubscribes from both chains. Once this returns, no more
    /// votes will be submitted to the sink. Does nothing if the relay is not running.
    ///
    /// A batch of peer votes which the worker has already taken off the queue is recorded in
    /// full before the worker exits. Batches still queued wait for the next session.
    pub async fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let _ = session.stop.send(true);

        match session.worker.await {
            Ok(inbound) => self.inbound = Some(inbound),
            Err(e) => {
                error!(error = %e, "relay worker failed");
                // The inbound queue went down with the worker.
                let (vote_source, inbound) = vote_channel();
                self.vote_source = vote_source;
                self.inbound = Some(inbound);
            }
        }
        info!("relay stopped");
    }

    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.worker.is_finished())
    }

    /// Hands a batch of votes received from peers to the relay. Never blocks.
    pub fn on_votes_received(&self, votes: Vec<BridgeVote>) {
        self.vote_source.on_votes_received(votes);
    }

    /// A handle for delivering peer votes from another task.
    pub fn vote_source(&self) -> VoteSource {
        self.vote_source.clone()
    }

    /// The last head observed from `origin` in the current or most recent session.
    pub fn last_seen(&self, origin: Origin) -> Option<ChainHeader> {
        self.last_seen.lock()[origin.index()]
    }

    pub fn vote_book(&self) -> MutexGuard<'_, VoteBook> {
        self.vote_book.lock()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.worker.abort();
        }
    }
}

enum Step {
    Stop,
    Event(WatcherEvent),
    Votes(Vec<BridgeVote>),
    Resubscribed(Result<(Origin, Option<HeadSubscription>), JoinError>),
}

struct Worker {
    config: RelayConfig,
    watcher: ChainHeadWatcher,
    signer: BridgeSigner,
    pubkey: ValidatorPubKey,
    sink: Arc<dyn VoteSink>,
    validator_delta: Arc<dyn ValidatorDeltaSource>,
    inbound: UnboundedReceiver<Vec<BridgeVote>>,
    last_seen: LastSeen,
    vote_book: Arc<Mutex<VoteBook>>,
    throttle: LogThrottle,
    resubscriptions: JoinSet<(Origin, Option<HeadSubscription>)>,
}

impl Worker {
    async fn run(mut self, mut stop: watch::Receiver<bool>) -> UnboundedReceiver<Vec<BridgeVote>> {
        loop {
            let step = select! {
                _ = stop.changed() => Step::Stop,
                event = self.watcher.next() => Step::Event(event),
                Some(votes) = self.inbound.recv() => Step::Votes(votes),
                Some(result) = self.resubscriptions.join_next(), if !self.resubscriptions.is_empty() => {
                    Step::Resubscribed(result)
                }
            };

            let stopping = *stop.borrow();
            match step {
                // Votes already taken off the queue would be lost otherwise.
                Step::Votes(votes) => self.record_votes(votes),
                Step::Stop => break,
                // A stop request may race with an event which was already buffered.
                _ if stopping => break,
                Step::Event(WatcherEvent::Head(origin, header)) => self.on_head(origin, header),
                Step::Event(WatcherEvent::SubscriptionFailed(origin, e)) => {
                    self.on_subscription_error(origin, e)
                }
                Step::Resubscribed(result) => self.on_resubscribed(result),
            }
            if stopping {
                break;
            }

            if self.is_exhausted() {
                error!("both head subscriptions are gone for good, ending the relay session");
                break;
            }
        }

        self.watcher.stop();
        self.resubscriptions.abort_all();
        for (class, suppressed) in self.throttle.flush() {
            warn!(class, suppressed, "log records suppressed before shutdown");
        }
        self.inbound
    }

    /// No chain is being watched and none will be again.
    fn is_exhausted(&self) -> bool {
        self.resubscriptions.is_empty()
            && Origin::ALL
                .iter()
                .all(|origin| !self.watcher.is_live(*origin))
    }

    fn on_head(&mut self, origin: Origin, header: ChainHeader) {
        self.last_seen.lock()[origin.index()] = Some(header);
        if let Ok(block_num) = u64::try_from(header.block_number) {
            self.vote_book
                .lock()
                .observe_head(self.config.chain_id(origin), block_num);
        }

        match self.vote(origin, &header) {
            Ok(vote) => {
                debug!(
                    %origin,
                    block = vote.block_num,
                    chain_id = vote.chain_id,
                    hash = %vote.hash,
                    "produced vote"
                );
                self.sink.submit(vote);
            }
            Err(e) => {
                let class = match e {
                    RelayError::Encoding(_) => "digest",
                    _ => "sign",
                };
                if let Some(suppressed) = self.throttle.check(class, Instant::now()) {
                    warn!(
                        %origin,
                        block = %header.block_number,
                        suppressed,
                        error = %e,
                        "failed to produce vote"
                    );
                }
            }
        }
    }

    fn vote(&self, origin: Origin, header: &ChainHeader) -> Result<BridgeVote, RelayError> {
        let chain_id = self.config.chain_id(origin);
        let delta = self.validator_delta.validator_delta(origin, header);
        let hash = build_digest(
            header.block_number,
            header.state_root,
            U256::from(chain_id),
            &delta,
        );
        let block_num = u64::try_from(header.block_number).map_err(|_| {
            RelayError::Encoding(format!(
                "block number {} does not fit in 64 bits",
                header.block_number
            ))
        })?;
        let signature = self
            .signer
            .sign_with_mode(&self.pubkey, &hash, self.config.signing_mode)?;

        Ok(BridgeVote {
            block_num,
            chain_id,
            hash,
            signature,
        })
    }

    fn on_subscription_error(&mut self, origin: Origin, error: SubscriptionError) {
        let class = match origin {
            Origin::Local => "local subscription",
            Origin::Remote => "remote subscription",
        };
        if let Some(suppressed) = self.throttle.check(class, Instant::now()) {
            warn!(%origin, suppressed, %error, "head subscription error");
        }

        if error.is_terminal() {
            self.resubscribe(origin);
        }
    }

    fn resubscribe(&mut self, origin: Origin) {
        let policy = self.config.resubscribe;
        if policy == ResubscribePolicy::Never {
            warn!(%origin, "head subscription closed, no more votes will be produced for this chain");
            return;
        }

        let feeds = self.watcher.feeds().clone();
        self.resubscriptions.spawn(async move {
            let mut attempt = 0;
            while let Some(delay) = policy.delay(attempt) {
                tokio::time::sleep(delay).await;
                match feeds.subscribe(origin).await {
                    Ok(subscription) => return (origin, Some(subscription)),
                    Err(e) => warn!(%origin, attempt, error = %e, "failed to resubscribe"),
                }
                attempt += 1;
            }
            (origin, None)
        });
    }

    fn on_resubscribed(&mut self, result: Result<(Origin, Option<HeadSubscription>), JoinError>) {
        match result {
            Ok((origin, Some(subscription))) => {
                if self.watcher.install(origin, subscription) {
                    info!(%origin, "resubscribed to chain heads");
                }
            }
            Ok((origin, None)) => {
                error!(%origin, "giving up on resubscribing, no more votes will be produced for this chain");
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!(error = %e, "resubscription task failed"),
        }
    }

    fn record_votes(&mut self, votes: Vec<BridgeVote>) {
        debug!(count = votes.len(), "received votes from peers");
        let mut book = self.vote_book.lock();
        for vote in &votes {
            match book.record(vote) {
                Ok(Recorded::New(signer)) => trace!(
                    %signer,
                    block = vote.block_num,
                    chain_id = vote.chain_id,
                    hash = %vote.hash,
                    "recorded peer vote"
                ),
                Ok(Recorded::Duplicate(signer)) => {
                    trace!(%signer, block = vote.block_num, "duplicate peer vote")
                }
                Ok(Recorded::Stale) => trace!(block = vote.block_num, "stale peer vote"),
                Ok(Recorded::Ahead) => trace!(block = vote.block_num, "peer vote too far ahead"),
                Ok(Recorded::UnwatchedChain) => {
                    trace!(chain_id = vote.chain_id, "peer vote for an unwatched chain")
                }
                Ok(Recorded::Full) => trace!(
                    block = vote.block_num,
                    chain_id = vote.chain_id,
                    "no room for peer vote"
                ),
                Err(e) => {
                    if let Some(suppressed) = self.throttle.check("peer vote", Instant::now()) {
                        warn!(
                            block = vote.block_num,
                            chain_id = vote.chain_id,
                            suppressed,
                            error = %e,
                            "invalid peer vote"
                        );
                    }
                }
            }
        }
    }
}
