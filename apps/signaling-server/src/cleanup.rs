//! Background sweep of expired sessions.
//!
//! Expiry is already enforced lazily on every access; the sweep only reclaims
//! memory held by codes nobody asks about again.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;

use crate::SessionRegistry;
use crate::config::CleanupConfig;

/// Spawn the sweep task.
///
/// Returns immediately (with a finished task) when the sweep is disabled.
pub fn spawn_cleanup_task(
    registry: Arc<SessionRegistry>,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!("Cleanup task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;

            let purged = registry.purge_expired();
            if purged > 0 {
                tracing::info!("Cleanup: removed {} expired sessions", purged);
            } else {
                tracing::debug!("Cleanup: no expired sessions");
            }
        }
    })
}
