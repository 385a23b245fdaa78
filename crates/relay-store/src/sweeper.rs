use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Periodically run `purge` until `cancel` fires.
pub(crate) fn spawn_sweeper<F>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    purge: F,
) -> JoinHandle<()>
where
    F: Fn() -> usize + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = purge();
                    if removed > 0 {
                        debug!(store = name, removed, "swept expired entries");
                    }
                }
            }
        }
    })
}
