use bitnode_network::PeerId;
use bitnode_primitives::Network;
use clap::Parser;
use std::path::PathBuf;

/// Parameters shared by every command.
#[derive(Debug, Clone, Parser)]
pub struct CommonParams {
    /// Specify the Bitcoin network.
    #[arg(long, value_name = "NETWORK", default_value = "mainnet")]
    pub network: Network,

    /// Specify the base directory of the node data.
    ///
    /// The chain state of each network lives in `<BASE_PATH>/<NETWORK>/chainstate`.
    #[arg(long, short = 'd', value_name = "PATH", default_value = "bitnode-data")]
    pub base_path: PathBuf,

    /// Sets the logging filter, e.g. `info,bitnode_network=debug`.
    ///
    /// `RUST_LOG` takes precedence when set.
    #[arg(long, short = 'l', value_name = "LOG_PATTERN", default_value = "info")]
    pub log: String,
}

impl CommonParams {
    /// Directory of the chain state database.
    pub fn chainstate_dir(&self) -> PathBuf {
        self.base_path.join(self.network.name()).join("chainstate")
    }
}

/// Bitcoin networking params.
#[derive(Debug, Clone, Parser)]
pub struct NetworkParams {
    /// Specify the remote peer address to connect.
    #[clap(long = "seednode", value_name = "SEEDNODE")]
    pub seednodes: Vec<String>,

    /// Connect to the nodes specified by `--seednode` only.
    ///
    /// Do not attempt to connect to the DNS seeds.
    #[clap(long)]
    pub seednode_only: bool,

    /// Specify the local address and listen on it.
    ///
    /// Defaults to the standard port of the network.
    #[clap(long)]
    pub listen: Option<PeerId>,

    /// Whether to connect to the IPv4 nodes only.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub ipv4_only: bool,

    /// Specify the maximum number of inbound peers.
    #[clap(long, default_value = "8")]
    pub max_inbound_peers: usize,

    /// Specify the maximum number of outbound peers.
    #[clap(long, default_value = "8")]
    pub max_outbound_peers: usize,

    /// Specify the maximum number of block windows downloaded concurrently.
    #[clap(long, default_value = "4")]
    pub max_inflight_windows: usize,
}

impl NetworkParams {
    pub fn network_config(&self, network: Network) -> bitnode_network::Config {
        let default = bitnode_network::Config::new(network);
        bitnode_network::Config {
            network,
            listen_on: self.listen.unwrap_or(default.listen_on),
            seednodes: self.seednodes.clone(),
            seednode_only: self.seednode_only,
            ipv4_only: self.ipv4_only,
            max_outbound_peers: self.max_outbound_peers,
            max_inbound_peers: self.max_inbound_peers,
            max_inflight_windows: self.max_inflight_windows,
        }
    }
}
