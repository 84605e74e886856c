use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::SessionRegistry;

/// Periodically sweep idle detached sessions until `cancel` fires.
pub fn spawn_reaper(
    registries: Vec<Arc<SessionRegistry>>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    for registry in &registries {
                        let evicted = registry.sweep().await;
                        if evicted > 0 {
                            info!(kind = %registry.kind().name, "Evicted {} idle sessions", evicted);
                        }
                    }
                }
            }
        }
        debug!("Session reaper stopped");
    })
}
