pub mod cfg;
pub mod crypto;
pub mod digest;
pub mod error;
pub mod feed;
pub mod keystore;
pub mod message;
pub mod ratelimit;
pub mod relay;
pub mod signer;
pub mod votes;
pub mod watcher;
