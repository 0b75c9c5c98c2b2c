//! Lookout cache: a local, indexed mirror of a remote collection kept in sync by
//! list-then-watch, with periodic resync and ordered handler delivery.
//!
//! Data flows reflector -> delta queue -> processing loop -> store (+ handlers);
//! the resync timer feeds the same queue and listers read the store.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lookout_core::{namespace_index_fn, ListWatch, ResourceVersion, TweakListOptions, NAMESPACE_INDEX};
use lookout_store::{DeltaQueue, IndexedStore, Indexers};
use tracing::{info, warn};

mod config;
mod controller;
mod handler;
mod reflector;
mod resync;

pub use config::CacheConfig;
pub use handler::{EventHandler, HandlerFns};
pub use lookout_store::{Lister, NamespaceLister};
pub use tokio_util::sync::CancellationToken;

use handler::Handlers;
use reflector::{Reflector, WatchCursor};

/// Watch cache over one remote collection.
pub struct Cache {
    source: Arc<dyn ListWatch>,
    store: Arc<IndexedStore>,
    queue: Arc<DeltaQueue>,
    handlers: Arc<Handlers>,
    cursor: Arc<WatchCursor>,
    tweak: Option<TweakListOptions>,
    cfg: CacheConfig,
    started: AtomicBool,
}

impl Cache {
    pub fn new(source: Arc<dyn ListWatch>, cfg: CacheConfig) -> Self {
        let mut indexers: Indexers = Vec::new();
        if cfg.namespace_index {
            indexers.push((NAMESPACE_INDEX.to_string(), namespace_index_fn()));
        }
        Self::with_indexers(source, cfg, indexers)
    }

    /// Like [`new`](Self::new) with `indexers` installed instead of the default.
    pub fn with_indexers(source: Arc<dyn ListWatch>, cfg: CacheConfig, indexers: Indexers) -> Self {
        Self {
            source,
            store: Arc::new(IndexedStore::new(indexers)),
            queue: Arc::new(DeltaQueue::new()),
            handlers: Arc::new(Handlers::default()),
            cursor: Arc::new(WatchCursor::default()),
            tweak: None,
            cfg,
            started: AtomicBool::new(false),
        }
    }

    /// Narrow every list/watch request (label or field selectors, timeouts).
    pub fn with_tweak(mut self, tweak: TweakListOptions) -> Self {
        self.tweak = Some(tweak);
        self
    }

    /// Register a handler. Objects already in the store are first replayed as adds.
    pub fn add_event_handler(&self, h: impl EventHandler + 'static) {
        self.handlers.register(Arc::new(h), &self.store);
    }

    /// True once the first full list has completed and its deltas were processed.
    pub fn has_synced(&self) -> bool {
        self.queue.has_synced()
    }

    /// Version token the next watch would resume from.
    pub fn last_synced_version(&self) -> Option<ResourceVersion> {
        self.cursor.get()
    }

    pub fn lister(&self) -> Lister {
        Lister::new(Arc::clone(&self.store))
    }

    pub fn store(&self) -> Arc<IndexedStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    /// Run until `stop` fires. The processing loop drains what is already queued before
    /// returning. A second call while running returns immediately.
    pub async fn run(&self, stop: CancellationToken) {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("cache already running");
            return;
        }
        info!(resync_secs = self.cfg.resync.as_secs(), "cache starting");
        let reflector = Reflector {
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            cursor: Arc::clone(&self.cursor),
            tweak: self.tweak.clone(),
            cfg: self.cfg.clone(),
        };
        let producers = async {
            tokio::join!(
                reflector.run(stop.clone()),
                resync::resync_loop(self.cfg.resync, Arc::clone(&self.store), Arc::clone(&self.queue), stop.clone()),
            );
            self.queue.close();
        };
        let consumer = controller::process_loop(Arc::clone(&self.queue), Arc::clone(&self.store), Arc::clone(&self.handlers));
        tokio::join!(producers, consumer);
        info!("cache stopped");
    }
}

/// Wait until every cache has synced. Returns false if `stop` fires first.
pub async fn wait_for_cache_sync(stop: &CancellationToken, caches: &[&Cache]) -> bool {
    let synced = poll_until(stop, Duration::from_millis(100), || caches.iter().all(|c| c.has_synced())).await;
    if !synced {
        warn!("stopped before caches synced");
    }
    synced
}

/// Poll `ready` until it holds or `stop` fires. Returns whether it held.
async fn poll_until(stop: &CancellationToken, period: Duration, ready: impl Fn() -> bool) -> bool {
    loop {
        if ready() {
            return true;
        }
        tokio::select! {
            _ = stop.cancelled() => return ready(),
            _ = tokio::time::sleep(period) => {}
        }
    }
}
