//! Periodic re-delivery of every stored object as a `Synced` delta.

use std::sync::Arc;
use std::time::Duration;

use lookout_core::Delta;
use lookout_store::{DeltaQueue, IndexedStore};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) async fn resync_loop(period: Duration, store: Arc<IndexedStore>, queue: Arc<DeltaQueue>, stop: CancellationToken) {
    if period.is_zero() {
        return;
    }
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let items = store.list();
                let count = items.len();
                for o in items {
                    queue.push(Delta::Synced(o));
                }
                debug!(count, "resync enqueued");
            }
        }
    }
}
