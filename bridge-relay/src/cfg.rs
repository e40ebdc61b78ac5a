use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{message::Origin, signer::SigningMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub local: LocalChainConfig,
    pub remote: RemoteChainConfig,
    /// The `V` convention of signatures in produced votes.
    #[serde(default)]
    pub signing_mode: SigningMode,
    /// Repeated failures of the same kind are logged at most once per interval.
    #[serde(default = "log_interval_default")]
    pub log_interval: Duration,
    /// Number of heads queued per origin before the feed waits for the relay to catch up.
    #[serde(default = "head_buffer_default")]
    pub head_buffer: usize,
    /// What to do when a head subscription is closed by its feed.
    #[serde(default)]
    pub resubscribe: ResubscribePolicy,
    /// Number of blocks behind the newest one for which votes received from peers are kept.
    #[serde(default = "vote_retention_blocks_default")]
    pub vote_retention_blocks: u64,
}

impl RelayConfig {
    pub fn new(local_chain_id: u64, remote: RemoteChainConfig) -> RelayConfig {
        RelayConfig {
            local: LocalChainConfig {
                chain_id: local_chain_id,
                rpc_url: None,
            },
            remote,
            signing_mode: SigningMode::default(),
            log_interval: log_interval_default(),
            head_buffer: head_buffer_default(),
            resubscribe: ResubscribePolicy::default(),
            vote_retention_blocks: vote_retention_blocks_default(),
        }
    }

    /// The chain id digests of heads from `origin` are scoped by.
    pub fn chain_id(&self, origin: Origin) -> u64 {
        match origin {
            Origin::Local => self.local.chain_id,
            Origin::Remote => self.remote.chain_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalChainConfig {
    pub chain_id: u64,
    /// Websocket endpoint of the local node. Only needed when the relay runs out of process.
    #[serde(default)]
    pub rpc_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteChainConfig {
    // Must be ws:// to support subscriptions.
    pub rpc_url: String,
    /// The chain id the remote node is expected to report.
    pub chain_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ResubscribePolicy {
    /// A closed origin stays dead until the relay is restarted.
    Never,
    /// Resubscribe with exponentially increasing delays.
    Backoff {
        #[serde(default = "initial_delay_default")]
        initial_delay: Duration,
        #[serde(default = "max_delay_default")]
        max_delay: Duration,
        /// Give up after this many failed attempts. Unlimited if not set.
        #[serde(default)]
        max_attempts: Option<u32>,
    },
}

impl Default for ResubscribePolicy {
    fn default() -> Self {
        ResubscribePolicy::Backoff {
            initial_delay: initial_delay_default(),
            max_delay: max_delay_default(),
            max_attempts: None,
        }
    }
}

impl ResubscribePolicy {
    /// The delay before resubscription attempt number `attempt` (starting at 0), or `None` if no
    /// more attempts should be made.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match *self {
            ResubscribePolicy::Never => None,
            ResubscribePolicy::Backoff {
                initial_delay,
                max_delay,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|max| attempt >= max) {
                    return None;
                }
                let factor = 2u32.saturating_pow(attempt.min(31));
                Some(initial_delay.saturating_mul(factor).min(max_delay))
            }
        }
    }
}

pub fn log_interval_default() -> Duration {
    Duration::from_secs(1)
}

pub fn head_buffer_default() -> usize {
    64
}

pub fn initial_delay_default() -> Duration {
    Duration::from_secs(1)
}

pub fn max_delay_default() -> Duration {
    Duration::from_secs(60)
}

pub fn vote_retention_blocks_default() -> u64 {
    256
}

pub fn read_config(config_file: &Path) -> Result<RelayConfig> {
    let config_content = fs::read_to_string(config_file)
        .with_context(|| format!("failed to read config file {}", config_file.display()))?;
    toml::from_str(&config_content)
        .with_context(|| format!("invalid config file {}", config_file.display()))
}
