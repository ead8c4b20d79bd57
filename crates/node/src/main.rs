//! Blockstorm node
//!
//! Funds a pool of ledger accounts, precomputes send/receive blocks for every
//! epoch and publishes them the moment the shared wall-clock deadline arrives.
//! Nodes find each other over gossip and report their throughput.

use anyhow::Result;
use clap::Parser;
use ledger_rpc::{HttpLedgerClient, LedgerRpc, MemoryLedger, DEFAULT_RPC_URL};
use std::net::SocketAddr;
use std::sync::Arc;
use storm_engine::{
    AccountPool, CoordinatorEvent, EngineError, PipelineState, ScheduleCoordinator,
    DEFAULT_BUFFER_CAPACITY, DEFAULT_EPOCH_SECS,
};
use storm_gossip::{GossipHandle, GossipNode};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::NodeConfig;

/// Precompute ledger blocks and publish them on a shared deadline
#[derive(Parser, Debug)]
#[command(name = "blockstorm")]
#[command(
    about = "Bulk block precompute and timed publish for a block-lattice ledger",
    long_about = None
)]
struct Args {
    /// Wallet id on the ledger node (required)
    #[arg(long)]
    wallet: Option<String>,

    /// Accounts in the pool
    #[arg(long, default_value = "100")]
    accounts: usize,

    /// Blocks per epoch across the whole pool
    #[arg(long, default_value = "30000")]
    transactions: u64,

    /// Ledger node RPC endpoint
    #[arg(long, default_value = DEFAULT_RPC_URL)]
    rpc_url: String,

    /// Epoch length in seconds
    #[arg(long, default_value_t = DEFAULT_EPOCH_SECS)]
    epoch_secs: u64,

    /// Gossip bind address
    #[arg(long, default_value = "0.0.0.0:9887")]
    gossip_addr: SocketAddr,

    /// Peer to contact at startup (repeatable)
    #[arg(long)]
    bootstrap: Vec<String>,

    /// Inbound gossip connections served at once
    #[arg(long, default_value = "64")]
    max_connections: usize,

    /// Rounds per account allocated before the buffer grows
    #[arg(long, default_value_t = DEFAULT_BUFFER_CAPACITY)]
    buffer_capacity: usize,

    /// Stop after N epochs (0 = run forever)
    #[arg(long, default_value = "0")]
    max_epochs: u64,

    /// Publish at the deadline even when precompute finishes early
    #[arg(long)]
    hold_until_deadline: bool,

    /// Use an in-memory ledger instead of the RPC endpoint
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = NodeConfig {
            wallet: self.wallet.unwrap_or_default(),
            accounts: self.accounts,
            transactions: self.transactions,
            rpc_url: self.rpc_url,
            buffer_capacity: self.buffer_capacity,
            dry_run: self.dry_run,
            ..Default::default()
        };
        config.coordinator.epoch_secs = self.epoch_secs;
        config.coordinator.max_epochs = self.max_epochs;
        config.coordinator.hold_until_deadline = self.hold_until_deadline;
        config.gossip.listen_addr = self.gossip_addr;
        config.gossip.bootstrap = self.bootstrap;
        config.gossip.max_connections = self.max_connections;
        config.finalize()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.into_config()?;
    run(config).await
}

async fn run(config: NodeConfig) -> Result<()> {
    tracing::info!("Starting blockstorm");
    tracing::info!("  Wallet: {}", config.wallet);
    tracing::info!(
        "  Pool: {} accounts, {} blocks per account per epoch",
        config.accounts,
        config.rounds_per_account()
    );
    tracing::info!("  Epoch length: {}s", config.coordinator.epoch_secs);

    let ledger: Arc<dyn LedgerRpc> = if config.dry_run {
        tracing::warn!("Dry run: publishing to an in-memory ledger");
        let funds = config.funding_target() * config.accounts as u128;
        Arc::new(MemoryLedger::with_balances(&config.wallet, &[funds]))
    } else {
        tracing::info!("  Ledger RPC: {}", config.rpc_url);
        Arc::new(HttpLedgerClient::with_url(&config.rpc_url, &config.wallet))
    };

    // Accounts and one-time funding
    let mut pool = AccountPool::open(ledger, config.accounts).await?;
    let transfers = pool.distribute_funds(config.funding_target()).await?;
    tracing::info!(
        "Pool funded with {} transfers, {} raw in total",
        transfers,
        pool.total_balance()
    );

    let gossip = GossipNode::new(config.gossip.clone()).start().await?;

    let (stop, shutdown) = watch::channel(false);
    let coordinator = ScheduleCoordinator::new(config.coordinator.clone()).with_shutdown(shutdown);
    let relay = tokio::spawn(relay_events(coordinator.subscribe(), gossip));

    let state = PipelineState::new(pool, config.buffer_capacity);
    let mut coordinator = tokio::spawn(coordinator.run(state));

    tracing::info!("Press Ctrl+C to stop.");

    tokio::select! {
        joined = &mut coordinator => finish(joined)?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Stopping after the current epoch (Ctrl+C again to quit now)");
            let _ = stop.send(true);
            tokio::select! {
                joined = &mut coordinator => finish(joined)?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("Quitting mid-epoch, unpublished blocks are lost");
                    coordinator.abort();
                    relay.abort();
                }
            }
        }
    }

    // Ends once the coordinator's event channel closes
    let _ = relay.await;
    tracing::info!("Node stopped");

    Ok(())
}

/// Report every published epoch to the swarm
async fn relay_events(mut events: broadcast::Receiver<CoordinatorEvent>, gossip: GossipHandle) {
    loop {
        match events.recv().await {
            Ok(CoordinatorEvent::Published(summary)) => {
                let peers = gossip.relay_tps(summary.tps).await;
                tracing::debug!("Epoch {} throughput sent to {} peers", summary.epoch, peers);
            }
            Ok(CoordinatorEvent::Scheduled { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Relay lagged {} coordinator events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

type Joined = std::result::Result<std::result::Result<PipelineState, EngineError>, JoinError>;

fn finish(joined: Joined) -> Result<()> {
    let state = joined??;
    tracing::info!(
        "Coordinator done, pool holds {} raw across {} accounts",
        state.pool.total_balance(),
        state.pool.len()
    );
    Ok(())
}
