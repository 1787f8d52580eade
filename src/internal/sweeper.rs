use std::time::Duration;

use tokio::{
    select,
    time::{Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broker::WeakBroker;

/// `tokio::time::interval` panics on a zero period.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A ticker for housekeeping loops: delays missed ticks and never ticks more
/// often than every millisecond.
pub(crate) fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period.max(MIN_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Periodically evict expired pending requests until `cancel` fires or the
/// broker is dropped.
pub(crate) async fn run_sweeper(broker: WeakBroker, interval: Duration, cancel: CancellationToken) {
    let mut ticker = ticker(interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(broker) = broker.upgrade() else {
                    break;
                };
                let evicted = broker.sweep();
                if evicted > 0 {
                    debug!(evicted, "sweep evicted expired requests");
                }
            }
        }
    }
    debug!("sweeper stopped");
}
