//! Single consumer draining the delta queue into the store and handlers.

use std::sync::Arc;

use lookout_store::{Applied, DeltaQueue, IndexedStore};
use tracing::{debug, info};

use crate::handler::Handlers;

/// Pop deltas in order, apply each to the store and notify handlers. Returns once
/// the queue is closed and drained.
pub(crate) async fn process_loop(queue: Arc<DeltaQueue>, store: Arc<IndexedStore>, handlers: Arc<Handlers>) {
    let mut processed: u64 = 0;
    while let Some(popped) = queue.pop().await {
        let delta = &popped.delta;
        let applied = handlers.process(&store, delta);
        match &applied {
            Applied::Stale => {}
            Applied::Deleted { known: false, .. } => {
                debug!(key = %delta.key(), "delete for key never stored; delivered to handlers")
            }
            other => debug!(key = %delta.key(), version = %delta.version(), transition = transition(other), "applied"),
        }
        processed += 1;
        if popped.completes_initial {
            queue.mark_synced();
            info!(objects = store.len(), "initial list processed; cache synced");
        }
    }
    info!(processed, "processing loop stopped");
}

fn transition(a: &Applied) -> &'static str {
    match a {
        Applied::Added(_) => "add",
        Applied::Updated { .. } => "update",
        Applied::Deleted { .. } => "delete",
        Applied::Synced(_) => "sync",
        Applied::Stale => "stale",
    }
}
