//! Periodic liveness sweep
//!
//! Keeps the `online` flag of every live connection from expiring between heartbeats and
//! times out pending requests whose deadline passed without their dispatcher noticing.

use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info};

use crate::AppState;

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub refreshed: usize,
    pub expired: usize,
}

/// Refresh presence for every registered connection and expire overdue requests
pub async fn run_liveness_sweep(state: &AppState) -> SweepReport {
    let now = Instant::now();
    let mut report = SweepReport::default();

    for connection in state.registry.connections() {
        if connection.is_closed() {
            continue;
        }
        state.presence.refresh_online(connection.info()).await;
        report.refreshed += 1;
        report.expired += connection.expire_overdue(now);
    }

    if report.expired > 0 {
        info!(expired = report.expired, "Expired overdue requests");
    }
    debug!(refreshed = report.refreshed, "Liveness sweep completed");
    report
}

/// Run the sweep forever at the configured interval
pub async fn liveness_loop(state: AppState) {
    let mut ticker = interval(state.config.liveness_sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        run_liveness_sweep(&state).await;
    }
}
