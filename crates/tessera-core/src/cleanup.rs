//! Background maintenance.
//!
//! One task periodically sweeps expired sessions, drops stale brute-force
//! counters and applies retention. It stops cleanly when its cancellation
//! token fires, finishing at most the batch it is working on.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::service::SessionService;

/// Start the maintenance loop. The first pass runs one `every` after start.
pub fn spawn_maintenance_task(
    service: Arc<SessionService>,
    every: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("session maintenance stopped");
                    break;
                }
                _ = ticker.tick() => {
                    run_maintenance(&service, &cancel).await;
                }
            }
        }
    })
}

/// One maintenance pass. Failures are logged and retried on the next tick.
pub async fn run_maintenance(service: &SessionService, cancel: &CancellationToken) {
    match service.cleanup_expired_until(cancel).await {
        Ok(0) => debug!("session cleanup: no expired sessions"),
        Ok(count) => info!(swept = count, "session cleanup completed"),
        Err(e) => warn!(error = %e, "session cleanup failed"),
    }

    let purged = service.purge_stale_attempts().await;
    if purged > 0 {
        debug!(purged, "stale attempt counters dropped");
    }

    if let Err(e) = service.purge_retained().await {
        warn!(error = %e, "retention purge failed");
    }

    match service.session_statistics().await {
        Ok(stats) => debug!(
            active_sessions = stats.active_sessions,
            active_users = stats.active_users,
            "session store status"
        ),
        Err(e) => debug!(error = %e, "failed to read session statistics"),
    }
}
