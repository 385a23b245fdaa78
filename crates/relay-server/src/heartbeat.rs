use std::time::Duration;

use relay_core::ServerId;
use relay_store::MonitoringStore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Report this server's heartbeat every `interval` until `cancel` fires.
/// The first report goes out immediately.
pub fn start_heartbeat(
    monitoring: MonitoringStore,
    server_id: ServerId,
    started: Instant,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let uptime = started.elapsed();
                    match monitoring.report_heartbeat(&server_id, uptime, VERSION).await {
                        Ok(()) => debug!(server_id = %server_id, uptime_secs = uptime.as_secs(), "heartbeat"),
                        Err(e) => warn!(server_id = %server_id, error = %e, "heartbeat failed"),
                    }
                }
            }
        }
        debug!(server_id = %server_id, "heartbeat stopped");
    })
}
