//! List-then-watch driver feeding the delta queue.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use backoff::backoff::Backoff;
use futures::StreamExt;
use lookout_core::{
    Delta, DeltaKind, ListOptions, ListWatch, Obj, ResourceVersion, SourceError, TweakListOptions, WatchEvent,
};
use lookout_store::{DeltaQueue, IndexedStore};
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;

/// Last version token seen for the whole collection.
#[derive(Debug, Default)]
pub(crate) struct WatchCursor(Mutex<Option<ResourceVersion>>);

impl WatchCursor {
    pub(crate) fn get(&self) -> Option<ResourceVersion> {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, v: ResourceVersion) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(v);
    }

    fn advance(&self, v: ResourceVersion) {
        let mut cur = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if cur.map_or(true, |c| v > c) {
            *cur = Some(v);
        }
    }
}

#[derive(Debug)]
enum WatchEnd {
    Stopped,
    /// Server closed the stream; `events` counts what it delivered first.
    Closed { events: usize },
    /// Cursor no longer served; relist.
    Gone,
    Failed(SourceError),
}

pub(crate) struct Reflector {
    pub(crate) source: Arc<dyn ListWatch>,
    pub(crate) store: Arc<IndexedStore>,
    pub(crate) queue: Arc<DeltaQueue>,
    pub(crate) cursor: Arc<WatchCursor>,
    pub(crate) tweak: Option<TweakListOptions>,
    pub(crate) cfg: CacheConfig,
}

impl Reflector {
    fn options(&self, mut opts: ListOptions) -> ListOptions {
        if let Some(tweak) = &self.tweak {
            tweak(&mut opts);
        }
        opts
    }

    pub(crate) async fn run(&self, stop: CancellationToken) {
        let mut backoff = self.cfg.backoff();
        'relist: loop {
            match self.relist(&stop).await {
                Ok(true) => backoff.reset(),
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "list failed; serving last known state");
                    if !self.pause(&stop, &mut backoff).await {
                        break;
                    }
                    continue;
                }
            }
            loop {
                match self.watch(&stop).await {
                    WatchEnd::Stopped => break 'relist,
                    WatchEnd::Closed { events } if events > 0 => {
                        debug!(events, "watch closed by server; resuming at cursor");
                        backoff.reset();
                    }
                    WatchEnd::Closed { .. } => {
                        debug!("watch closed without events");
                        if !self.pause(&stop, &mut backoff).await {
                            break 'relist;
                        }
                    }
                    WatchEnd::Gone => {
                        info!(cursor = ?self.cursor.get(), "watch cursor expired; relisting");
                        counter!("lookout_relist_total", 1u64);
                        continue 'relist;
                    }
                    WatchEnd::Failed(e) => {
                        warn!(error = %e, cursor = ?self.cursor.get(), "watch failed; retrying at cursor");
                        if !self.pause(&stop, &mut backoff).await {
                            break 'relist;
                        }
                    }
                }
            }
        }
        info!("reflector stopped");
    }

    // Backoff sleep that yields early on shutdown. Returns false when stopped.
    async fn pause(&self, stop: &CancellationToken, backoff: &mut impl Backoff) -> bool {
        let d = backoff.next_backoff().unwrap_or(self.cfg.backoff_max);
        debug!(delay_ms = d.as_millis() as u64, "backing off");
        tokio::select! {
            _ = stop.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }

    /// Full list diffed against everything the queue will have applied. Returns
    /// `Ok(false)` when stopped.
    async fn relist(&self, stop: &CancellationToken) -> Result<bool, SourceError> {
        let opts = self.options(ListOptions::default());
        let started = Instant::now();
        let list = tokio::select! {
            _ = stop.cancelled() => return Ok(false),
            r = self.source.list(&opts) => r?,
        };
        histogram!("lookout_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        let version = ResourceVersion::parse(&list.version).map_err(|e| SourceError::Malformed(e.to_string()))?;

        let known = self.queue.projected_state(&self.store);

        let total = list.items.len();
        let mut seen = FxHashSet::default();
        let (mut added, mut updated, mut deleted) = (0usize, 0usize, 0usize);
        for raw in list.items {
            let obj = match Obj::from_raw(raw) {
                Ok(o) => Arc::new(o),
                Err(e) => {
                    warn!(error = %e, "dropping unkeyable object from list");
                    continue;
                }
            };
            seen.insert(obj.key.clone());
            match known.get(&obj.key) {
                None => {
                    self.queue.push(Delta::Added(obj));
                    added += 1;
                }
                Some(cur) if cur.version < obj.version => {
                    self.queue.push(Delta::Updated(obj));
                    updated += 1;
                }
                Some(_) => {}
            }
        }
        let mut gone: Vec<_> = known.into_iter().filter(|(k, _)| !seen.contains(k)).collect();
        gone.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, obj) in gone {
            self.queue.push(Delta::Deleted(obj));
            deleted += 1;
        }

        self.queue.mark_populated();
        self.cursor.set(version);
        info!(items = total, added, updated, deleted, version = %version, took_ms = started.elapsed().as_millis() as u64, "list complete");
        Ok(true)
    }

    async fn watch(&self, stop: &CancellationToken) -> WatchEnd {
        let opts = self.options(ListOptions {
            resource_version: self.cursor.get().map(|v| v.to_string()),
            timeout_seconds: self.cfg.watch_timeout_secs,
            allow_bookmarks: true,
            ..ListOptions::default()
        });
        let opened = tokio::select! {
            _ = stop.cancelled() => return WatchEnd::Stopped,
            r = self.source.watch(&opts) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) if e.is_gone() => return WatchEnd::Gone,
            Err(e) => return WatchEnd::Failed(e),
        };
        counter!("lookout_watch_opens_total", 1u64);
        debug!(from = ?opts.resource_version, "watch opened");

        let mut events = 0usize;
        // dropping `stream` on any return closes the connection
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => return WatchEnd::Stopped,
                n = stream.next() => n,
            };
            match next {
                None => return WatchEnd::Closed { events },
                Some(Err(e)) if e.is_gone() => return WatchEnd::Gone,
                Some(Err(e)) => return WatchEnd::Failed(e),
                Some(Ok(ev)) => {
                    events += 1;
                    self.handle_event(ev);
                }
            }
        }
    }

    fn handle_event(&self, ev: WatchEvent) {
        let (raw, kind) = match ev {
            WatchEvent::Bookmark(v) => {
                match ResourceVersion::parse(&v) {
                    Ok(rv) => self.cursor.advance(rv),
                    Err(e) => warn!(error = %e, "ignoring malformed bookmark"),
                }
                return;
            }
            WatchEvent::Added(raw) => (raw, DeltaKind::Added),
            WatchEvent::Modified(raw) => (raw, DeltaKind::Updated),
            WatchEvent::Deleted(raw) => (raw, DeltaKind::Deleted),
        };
        let obj = match Obj::from_raw(raw) {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "dropping unkeyable watch event");
                return;
            }
        };
        if self.cursor.get().is_some_and(|c| obj.version <= c) {
            debug!(key = %obj.key, version = %obj.version, "event at or below cursor; already reflected");
            counter!("lookout_stale_dropped_total", 1u64);
            return;
        }
        if let Some(stored) = self.store.version_of(&obj.key) {
            if obj.version < stored || (obj.version == stored && kind != DeltaKind::Deleted) {
                debug!(key = %obj.key, version = %obj.version, stored = %stored, "stale event dropped");
                counter!("lookout_stale_dropped_total", 1u64);
                return;
            }
        }
        let version = obj.version;
        let obj = Arc::new(obj);
        let delta = match kind {
            DeltaKind::Deleted => Delta::Deleted(obj),
            DeltaKind::Updated => Delta::Updated(obj),
            _ => Delta::Added(obj),
        };
        self.queue.push(delta);
        self.cursor.set(version);
    }
}
