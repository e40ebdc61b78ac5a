use thiserror::Error;

use crate::crypto::PubKeyType;

/// Errors surfaced by the relay.
///
/// Construction-time failures (`Connection`, `ChainIdMismatch`) are returned to the caller of
/// [crate::relay::Relay::new] or [crate::relay::Relay::start]. Everything else is scoped to a
/// single vote attempt and only ever reaches the logs once a session is running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("failed to connect to chain endpoint: {0}")]
    Connection(String),
    #[error("unexpected chain id of the connected node: {actual} != {expected}")]
    ChainIdMismatch { expected: u64, actual: u64 },
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("unsupported key type: {0:?}")]
    UnsupportedKeyType(PubKeyType),
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("relay already running")]
    AlreadyStarted,
}

/// An error reported by a head subscription, delivered on that subscription's error channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The subscriber fell behind and `0` notifications were dropped. The subscription is still
    /// alive.
    #[error("subscription lagged behind by {0} notifications")]
    Lagged(u64),
    /// The underlying feed has gone away; no more heads will be delivered on this subscription.
    #[error("subscription closed")]
    Closed,
    #[error("subscription transport error: {0}")]
    Transport(String),
}

impl SubscriptionError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionError::Closed)
    }
}
