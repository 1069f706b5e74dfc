use anyhow::{Context, Result};
use clap::Parser;
use desci_node::{
    api::{self, AppState},
    chain::{ChainSource, EthersChainSource},
    config::NodeConfig,
    demo,
    listener::ListenerSupervisor,
    metrics,
    projector::EventProjector,
    storage::SyncStore,
    verify::ContentVerifier,
};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// DeSci sync node arguments
#[derive(Parser)]
#[clap(name = "desci_node")]
#[clap(about = "Mirrors DeSci platform contract events into a queryable store")]
struct Args {
    /// Path to node configuration file
    #[clap(long, default_value = "config/desci.yaml")]
    config: PathBuf,

    /// API port to listen on
    #[clap(long)]
    api_port: Option<u16>,

    /// Chain JSON-RPC endpoint
    #[clap(long)]
    rpc_url: Option<String>,

    /// RocksDB directory
    #[clap(long)]
    data_dir: Option<String>,

    /// Project the demo research record and dataset on startup
    #[clap(long)]
    seed_demo: bool,

    /// Serve the API without syncing from the chain
    #[clap(long)]
    no_listener: bool,

    /// Print the effective configuration and exit
    #[clap(long)]
    print_config: bool,
}

impl Args {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(port) = self.api_port {
            config.api.port = port;
        }
        if let Some(rpc_url) = &self.rpc_url {
            config.chain.rpc_url = rpc_url.clone();
        }
        if let Some(data_dir) = &self.data_dir {
            config.storage.data_dir = data_dir.clone();
        }
    }
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = NodeConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    args.apply(&mut config);
    config.validate()?;

    if args.print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    info!("Starting DeSci sync node...");
    info!("Config path: {:?}", args.config);
    info!("Chain RPC: {}", config.chain.rpc_url);
    info!("Data dir: {}", config.storage.data_dir);

    metrics::init_metrics().context("Failed to register metrics")?;

    let store = Arc::new(SyncStore::open(&config.storage.data_dir)?);

    if args.seed_demo {
        let projector = EventProjector::new(store.clone());
        demo::seed_demo_data(&projector, config.verify.algorithm)?;
    }

    let supervisor = if args.no_listener {
        info!("Listeners disabled; serving existing data only");
        None
    } else {
        let source: Arc<dyn ChainSource> =
            Arc::new(EthersChainSource::new(&config.chain.rpc_url, config.chain.poll_interval())?);
        Some(ListenerSupervisor::spawn(&config, source, store.clone())?)
    };

    let state = AppState {
        store: store.clone(),
        verifier: Arc::new(ContentVerifier::new(config.verify.algorithm)),
        listeners: supervisor.as_ref().map(|s| s.statuses()).unwrap_or_default(),
        api: config.api.clone(),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let served = api::serve(&config.api, state, shutdown.clone().cancelled_owned()).await;
    shutdown.cancel();

    if let Some(supervisor) = supervisor {
        info!("Waiting for listeners to finish their current batch...");
        supervisor.shutdown().await;
    }

    served?;
    info!("DeSci sync node stopped");
    Ok(())
}
