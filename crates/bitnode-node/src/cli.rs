pub mod params;

use self::params::{CommonParams, NetworkParams};
use crate::Error;
use crate::service::{self, NodeComponents};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Lightweight Bitcoin node.
#[derive(Debug, Parser)]
#[command(name = "bitnode", version)]
pub struct Cli {
    #[allow(missing_docs)]
    #[clap(flatten)]
    pub common_params: CommonParams,

    #[allow(missing_docs)]
    #[clap(flatten)]
    pub network_params: NetworkParams,
}

fn init_logger(log: &str) -> Result<(), Error> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log))
        .map_err(|err| Error::Logger(err.to_string()))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|err| Error::Logger(err.to_string()))
}

/// Parse and run command line arguments
pub fn run() -> Result<(), Error> {
    let Cli {
        common_params,
        network_params,
    } = Cli::parse();

    init_logger(&common_params.log)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(start(common_params, network_params))
}

async fn start(common_params: CommonParams, network_params: NetworkParams) -> Result<(), Error> {
    let network = common_params.network;

    tracing::info!("✌️  bitnode {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("⛓  Bitcoin network: {network}");

    let NodeComponents { chain, mempool } = service::new_node(&common_params)?;

    let tip = chain.local_tip()?;
    tracing::info!("📦 Highest known block at #{} ({})", tip.height, tip.hash);

    tokio::spawn(service::remove_committed_transactions(
        chain.clone(),
        mempool.clone(),
    ));

    let network_handle = bitnode_network::build_network(
        chain.clone(),
        mempool,
        network_params.network_config(network),
    )
    .await?;

    tokio::spawn(crate::informant::run(chain, network_handle));

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");

    Ok(())
}
