use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Shared;

/// Asks the transport loop for a heartbeat probe every `heartbeat_interval`
pub(crate) async fn run_heartbeat(shared: Arc<Shared>, shutdown: CancellationToken) {
    let period = shared.config.heartbeat_interval;
    run_periodic("heartbeat", period, shutdown, || shared.request_heartbeat()).await;
}

/// Asks the transport loop to judge missed heartbeats every
/// `availability_check_interval`
pub(crate) async fn run_availability_check(shared: Arc<Shared>, shutdown: CancellationToken) {
    let period = shared.config.availability_check_interval;
    run_periodic("availability check", period, shutdown, || shared.request_evaluation()).await;
}

async fn run_periodic<F>(name: &'static str, period: Duration, shutdown: CancellationToken, mut tick: F)
where
    F: FnMut(),
{
    // First tick one period after start, not immediately
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(timer = name, ?period, "Timer started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => tick(),
        }
    }
    debug!(timer = name, "Timer stopped");
}
