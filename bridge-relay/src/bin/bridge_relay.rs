use std::{
    backtrace::{Backtrace, BacktraceStatus},
    panic::PanicHookInfo,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Result, anyhow};
use bridge_relay::{
    cfg::read_config,
    feed::{ChainClient, RemoteChain},
    keystore::MemoryKeystore,
    message::BridgeVote,
    relay::Relay,
    signer::BridgeSigner,
};
use clap::Parser;
use k256::ecdsa::SigningKey;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Hex encoded secp256k1 bridge key of this validator.
    #[arg(value_parser = secret_key_from_hex)]
    secret_key: SigningKey,
    #[clap(long, short, default_value = "config.toml")]
    config_file: PathBuf,
    #[clap(long, default_value = "false")]
    log_json: bool,
}

fn secret_key_from_hex(s: &str) -> Result<SigningKey> {
    let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))?;
    Ok(SigningKey::from_slice(&bytes)?)
}

/// Records a panic as a `tracing` event at the `ERROR` verbosity level.
fn log_panic(panic: &PanicHookInfo<'_>) {
    let payload = panic.payload();
    let message = payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("Box<dyn Any>");
    let thread = std::thread::current();

    let backtrace = Backtrace::capture();
    let backtrace =
        (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());

    let location = panic.location();
    tracing::error!(
        thread_name = thread.name().unwrap_or("<unnamed>"),
        message,
        panic.file = location.map(|l| l.file()),
        panic.line = location.map(|l| l.line()),
        panic.column = location.map(|l| l.column()),
        backtrace = backtrace.as_deref(),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_line_number(true)
        .with_ansi(false);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    std::panic::set_hook(Box::new(log_panic));

    let config = read_config(&args.config_file)?;

    let keystore = Arc::new(MemoryKeystore::new());
    let pubkey = keystore.insert(args.secret_key);
    keystore.unlock(&pubkey)?;
    info!(address = %pubkey.address()?, "loaded validator key");

    let local_url = config
        .local
        .rpc_url
        .as_deref()
        .ok_or_else(|| anyhow!("local.rpc_url must be set to run the relay as a separate process"))?;
    let local = ChainClient::connect(local_url, config.head_buffer).await?;
    let local_chain_id = local.chain_id().await?;
    if local_chain_id != config.local.chain_id {
        return Err(anyhow!(
            "local node at {local_url} reports chain id {local_chain_id}, expected {}",
            config.local.chain_id
        ));
    }

    let (sink, mut votes) = mpsc::unbounded_channel::<BridgeVote>();
    let printer = tokio::spawn(async move {
        while let Some(vote) = votes.recv().await {
            match serde_json::to_string(&vote) {
                Ok(vote) => info!(%vote, "vote"),
                Err(e) => tracing::error!(error = %e, "failed to serialize vote"),
            }
        }
    });

    let mut relay = Relay::connect(
        config,
        Arc::new(local),
        BridgeSigner::new(keystore),
        pubkey,
        Arc::new(sink),
    )
    .await?;
    relay.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    relay.stop().await;
    drop(relay);
    printer.await?;

    Ok(())
}
