//! Periodic report of the sync progress.

use bitnode_chain::Chain;
use bitnode_network::{NetworkHandle, NetworkStatus, SyncState};
use bitnode_primitives::{BlockNumber, Hash256};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Logs the node status every [`REPORT_INTERVAL`] until the network stops.
pub(crate) async fn run(chain: Arc<Chain>, network: NetworkHandle) {
    let mut display = InformantDisplay::new();
    let mut interval = tokio::time::interval(REPORT_INTERVAL);

    loop {
        interval.tick().await;

        let Some(net_status) = network.status().await else {
            return;
        };

        match chain.local_tip() {
            Ok(tip) => display.display(tip.height, tip.hash, net_status),
            Err(err) => tracing::warn!(?err, "Failed to read the local tip"),
        }
    }
}

/// Last four and first six hex digits of a block hash.
struct ShortHash(Hash256);

impl fmt::Display for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.0.to_string();
        write!(f, "{}…{}", &hex[..4], &hex[hex.len() - 6..])
    }
}

struct InformantDisplay {
    last_number: Option<BlockNumber>,
    last_update: Instant,
    last_total_bytes_inbound: u64,
    last_total_bytes_outbound: u64,
}

impl InformantDisplay {
    fn new() -> Self {
        Self {
            last_number: None,
            last_update: Instant::now(),
            last_total_bytes_inbound: 0,
            last_total_bytes_outbound: 0,
        }
    }

    fn display(&mut self, best_number: BlockNumber, best_hash: Hash256, net_status: NetworkStatus) {
        let elapsed = self.last_update.elapsed();
        let speed = speed(best_number, self.last_number, elapsed);

        let secs = elapsed.as_secs().max(1);
        let inbound = net_status
            .total_bytes_inbound
            .saturating_sub(self.last_total_bytes_inbound)
            / secs;
        let outbound = net_status
            .total_bytes_outbound
            .saturating_sub(self.last_total_bytes_outbound)
            / secs;

        self.last_update = Instant::now();
        self.last_number = Some(best_number);
        self.last_total_bytes_inbound = net_status.total_bytes_inbound;
        self.last_total_bytes_outbound = net_status.total_bytes_outbound;

        let target = net_status.best_number;
        let (level, status) = match net_status.sync_state {
            SyncState::Sync => {
                let progress = best_number as f64 * 100.0 / target.max(1) as f64;
                ("⚙️ ", format!("Syncing{speed}, target=#{target} ({progress:.2}%)"))
            }
            SyncState::Synchronized => ("💤", "Idle".to_string()),
            state => ("💤", format!("{state:?}")),
        };

        tracing::info!(
            "{level} {status} ({} peers), best: #{best_number} ({}), ⬇ {} ⬆ {}",
            net_status.num_connected_peers,
            ShortHash(best_hash),
            TransferRate(inbound),
            TransferRate(outbound),
        );
    }
}

/// Blocks per second since the last report, empty on the first report.
fn speed(best_number: BlockNumber, last_number: Option<BlockNumber>, elapsed: Duration) -> String {
    let Some(last_number) = last_number else {
        return String::new();
    };
    let elapsed_ms = elapsed.as_millis().max(1);
    let diff = u128::from(best_number.saturating_sub(last_number));
    let speed = (diff * 10_000 / elapsed_ms) as f64 / 10.0;
    format!(" {speed:4.1} bps")
}

struct TransferRate(u64);

impl fmt::Display for TransferRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "0"),
            n if n < 100 => write!(f, "{n} B/s"),
            n if n < 1024 * 1024 => write!(f, "{:.1}kiB/s", n as f64 / 1024.0),
            n => write!(f, "{:.1}MiB/s", n as f64 / (1024.0 * 1024.0)),
        }
    }
}
