use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lookout_core::{Delta, Obj, ObjKey};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};
use tokio::sync::Notify;
use tracing::trace;

use crate::IndexedStore;

/// An item handed to the single consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Popped {
    pub delta: Delta,
    /// Set on the last item of the initial population; the consumer calls
    /// [`DeltaQueue::mark_synced`] once it has processed it.
    pub completes_initial: bool,
}

// Pending deltas for one key: a single entry, or a `Deleted` followed by the
// re-creation that arrived after it.
type Pending = SmallVec<[Delta; 2]>;

/// Coalescing map keyed by object key with FIFO order of first arrival.
#[derive(Default)]
struct Coalescer {
    map: FxHashMap<ObjKey, Pending>,
    order: VecDeque<ObjKey>,
    closed: bool,
    populated: bool,
    initial_remaining: usize,
}

enum Merge {
    Replace(Delta),
    Append(Delta),
    Keep,
}

// `pending` is the newest unprocessed delta for the key; decide what happens to `incoming`.
fn merge(pending: &Delta, incoming: Delta) -> Merge {
    let pv = pending.version();
    match (pending, incoming) {
        (_, Delta::Deleted(n)) => {
            if n.version < pv { Merge::Keep } else { Merge::Replace(Delta::Deleted(n)) }
        }
        (Delta::Synced(_), Delta::Synced(n)) => Merge::Replace(Delta::Synced(n)),
        (_, Delta::Synced(_)) => Merge::Keep,
        (_, d) if d.version() <= pv => Merge::Keep,
        // deleted and re-created before processing: both are delivered, in order
        (Delta::Deleted(_), d) => Merge::Append(d),
        (Delta::Added(_), Delta::Updated(n)) => Merge::Replace(Delta::Updated(n)),
        (_, d) => Merge::Replace(d),
    }
}

impl Coalescer {
    fn push(&mut self, d: Delta) -> bool {
        let key = d.key().clone();
        let Some(pending) = self.map.get_mut(&key) else {
            self.order.push_back(key.clone());
            self.map.insert(key, smallvec![d]);
            return false;
        };
        let Some(last) = pending.last() else {
            pending.push(d);
            return false;
        };
        match merge(last, d) {
            Merge::Replace(next) => {
                if let Some(last) = pending.last_mut() {
                    *last = next;
                }
            }
            Merge::Append(next) => pending.push(next),
            Merge::Keep => {}
        }
        // a re-creation deleted again collapses to the latest delete
        if pending.len() == 2 && matches!(pending[1], Delta::Deleted(_)) {
            pending.remove(0);
        }
        true
    }

    fn pop_front(&mut self) -> Option<Popped> {
        while let Some(key) = self.order.pop_front() {
            let Some(pending) = self.map.get_mut(&key) else { continue };
            if pending.is_empty() {
                self.map.remove(&key);
                continue;
            }
            let delta = pending.remove(0);
            if pending.is_empty() {
                self.map.remove(&key);
            } else {
                // the follow-up for this key goes next
                self.order.push_front(key);
            }
            let mut completes_initial = false;
            if self.initial_remaining > 0 {
                self.initial_remaining -= 1;
                completes_initial = self.initial_remaining == 0;
            }
            return Some(Popped { delta, completes_initial });
        }
        None
    }

    fn depth(&self) -> usize {
        self.map.values().map(|p| p.len()).sum()
    }
}

/// Net effect of pending deltas on `base`: the newest non-sync delta per key wins.
fn project(effects: Vec<(ObjKey, Option<Arc<Obj>>)>, mut base: FxHashMap<ObjKey, Arc<Obj>>) -> FxHashMap<ObjKey, Arc<Obj>> {
    for (key, effect) in effects {
        match effect {
            Some(o) => {
                base.insert(key, o);
            }
            None => {
                base.remove(&key);
            }
        }
    }
    base
}

/// Ordered, deduplicating queue of pending deltas with one consumer.
///
/// At most one entry exists per key, so memory tracks distinct in-flight keys
/// rather than event volume.
#[derive(Default)]
pub struct DeltaQueue {
    inner: Mutex<Coalescer>,
    notify: Notify,
    synced: AtomicBool,
}

impl DeltaQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Coalescer> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue, merging into a pending entry for the same key. Ignored once closed.
    pub fn push(&self, d: Delta) {
        let mut q = self.lock();
        if q.closed {
            return;
        }
        trace!(key = %d.key(), kind = ?d.kind(), version = %d.version(), "queue push");
        if q.push(d) {
            counter!("lookout_queue_coalesced_total", 1u64);
        }
        gauge!("lookout_queue_depth", q.depth() as f64);
        drop(q);
        self.notify.notify_one();
    }

    /// Wait for the next delta. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<Popped> {
        loop {
            let notified = self.notify.notified();
            {
                let mut q = self.lock();
                if let Some(p) = q.pop_front() {
                    gauge!("lookout_queue_depth", q.depth() as f64);
                    return Some(p);
                }
                if q.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`pop`](Self::pop).
    pub fn try_pop(&self) -> Option<Popped> {
        self.lock().pop_front()
    }

    /// Record that the first full list has been enqueued. Only the first call counts.
    pub fn mark_populated(&self) {
        let mut q = self.lock();
        if q.populated {
            return;
        }
        q.populated = true;
        q.initial_remaining = q.depth();
        if q.initial_remaining == 0 {
            self.synced.store(true, Ordering::Release);
        }
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    /// True once the initial population has been popped and processed.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Final effect of each pending key: `Some` for an add or update, `None` for a
    /// delete. Keys with only a pending sync are left out.
    pub fn pending_effects(&self) -> Vec<(ObjKey, Option<Arc<Obj>>)> {
        let q = self.lock();
        q.order
            .iter()
            .filter_map(|key| match q.map.get(key).and_then(|p| p.last()) {
                Some(Delta::Added(o)) | Some(Delta::Updated(o)) => Some((key.clone(), Some(Arc::clone(o)))),
                Some(Delta::Deleted(_)) => Some((key.clone(), None)),
                Some(Delta::Synced(_)) | None => None,
            })
            .collect()
    }

    /// What `store` will hold once every pending delta has been applied.
    ///
    /// Pending effects are captured before the store snapshot: a delta the consumer
    /// applies in between then shows up in both, with the same net result.
    pub fn projected_state(&self, store: &IndexedStore) -> FxHashMap<ObjKey, Arc<Obj>> {
        let effects = self.pending_effects();
        project(effects, store.snapshot_map())
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of pending deltas.
    pub fn len(&self) -> usize {
        self.lock().depth()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookout_core::ResourceVersion;
    use serde_json::json;

    fn obj(name: &str, rv: u64) -> Arc<Obj> {
        Arc::new(
            Obj::from_raw(json!({ "metadata": { "name": name, "namespace": "ns", "resourceVersion": rv.to_string() } }))
                .unwrap(),
        )
    }

    fn drain(q: &DeltaQueue) -> Vec<Delta> {
        std::iter::from_fn(|| q.try_pop().map(|p| p.delta)).collect()
    }

    #[test]
    fn added_then_updated_collapses_to_updated() {
        let q = DeltaQueue::new();
        q.push(Delta::Added(obj("a", 1)));
        q.push(Delta::Updated(obj("a", 2)));
        assert_eq!(drain(&q), vec![Delta::Updated(obj("a", 2))]);
    }

    #[test]
    fn any_then_deleted_collapses_to_deleted() {
        let q = DeltaQueue::new();
        q.push(Delta::Added(obj("a", 1)));
        q.push(Delta::Deleted(obj("a", 2)));
        q.push(Delta::Updated(obj("b", 3)));
        q.push(Delta::Deleted(obj("b", 4)));
        assert_eq!(drain(&q), vec![Delta::Deleted(obj("a", 2)), Delta::Deleted(obj("b", 4))]);
    }

    #[test]
    fn first_arrival_order_is_preserved_across_keys() {
        let q = DeltaQueue::new();
        q.push(Delta::Added(obj("a", 1)));
        q.push(Delta::Added(obj("b", 2)));
        q.push(Delta::Updated(obj("a", 3)));
        q.push(Delta::Added(obj("c", 4)));
        let keys: Vec<String> = drain(&q).iter().map(|d| d.key().name.clone()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn stale_and_duplicate_pushes_are_ignored() {
        let q = DeltaQueue::new();
        q.push(Delta::Updated(obj("a", 5)));
        q.push(Delta::Updated(obj("a", 5)));
        q.push(Delta::Updated(obj("a", 4)));
        q.push(Delta::Deleted(obj("a", 3)));
        assert_eq!(drain(&q), vec![Delta::Updated(obj("a", 5))]);
    }

    #[test]
    fn synced_yields_to_real_changes() {
        let q = DeltaQueue::new();
        q.push(Delta::Synced(obj("a", 1)));
        q.push(Delta::Updated(obj("a", 2)));
        q.push(Delta::Synced(obj("a", 2)));
        q.push(Delta::Synced(obj("b", 1)));
        q.push(Delta::Synced(obj("b", 1)));
        assert_eq!(drain(&q), vec![Delta::Updated(obj("a", 2)), Delta::Synced(obj("b", 1))]);
    }

    #[test]
    fn initial_population_tracking() {
        let q = DeltaQueue::new();
        q.push(Delta::Added(obj("a", 1)));
        q.push(Delta::Added(obj("b", 1)));
        q.mark_populated();
        q.push(Delta::Added(obj("c", 2)));
        assert!(!q.has_synced());
        assert!(!q.try_pop().unwrap().completes_initial);
        assert!(q.try_pop().unwrap().completes_initial);
        assert!(!q.try_pop().unwrap().completes_initial);
    }

    #[test]
    fn empty_initial_population_is_synced_immediately() {
        let q = DeltaQueue::new();
        q.mark_populated();
        assert!(q.has_synced());
    }

    #[test]
    fn projection_reflects_pending_effects() {
        let store = IndexedStore::default();
        store.apply(&Delta::Added(obj("gone", 1)));
        let q = DeltaQueue::new();
        q.push(Delta::Deleted(obj("gone", 2)));
        q.push(Delta::Added(obj("new", 3)));
        q.push(Delta::Synced(obj("synced-only", 1)));
        let known = q.projected_state(&store);
        assert_eq!(known.len(), 1);
        assert_eq!(known[&ObjKey::namespaced("ns", "new")].version, ResourceVersion(3));
    }

    #[test]
    fn projection_is_stable_when_consumer_applies_between_reads() {
        let store = IndexedStore::default();
        store.apply(&Delta::Added(obj("a", 1)));
        let q = DeltaQueue::new();
        q.push(Delta::Deleted(obj("a", 2)));
        q.push(Delta::Added(obj("b", 3)));

        let effects = q.pending_effects();
        // consumer drains and applies before the store is read
        while let Some(p) = q.try_pop() {
            store.apply(&p.delta);
        }
        let known = project(effects, store.snapshot_map());
        assert!(!known.contains_key(&ObjKey::namespaced("ns", "a")));
        assert_eq!(known[&ObjKey::namespaced("ns", "b")].version, ResourceVersion(3));
        assert_eq!(known, q.projected_state(&store));
    }

    #[test]
    fn delete_then_recreate_keeps_both_in_order() {
        let q = DeltaQueue::new();
        q.push(Delta::Deleted(obj("a", 2)));
        q.push(Delta::Added(obj("b", 3)));
        q.push(Delta::Added(obj("a", 4)));
        q.push(Delta::Updated(obj("a", 5)));
        assert_eq!(q.len(), 3);
        assert_eq!(
            drain(&q),
            vec![Delta::Deleted(obj("a", 2)), Delta::Updated(obj("a", 5)), Delta::Added(obj("b", 3))]
        );
    }

    #[test]
    fn recreate_deleted_again_collapses_to_latest_delete() {
        let q = DeltaQueue::new();
        q.push(Delta::Deleted(obj("a", 2)));
        q.push(Delta::Added(obj("a", 3)));
        q.push(Delta::Deleted(obj("a", 4)));
        q.push(Delta::Synced(obj("a", 4)));
        q.push(Delta::Added(obj("a", 2)));
        assert_eq!(drain(&q), vec![Delta::Deleted(obj("a", 4))]);
    }

    #[tokio::test]
    async fn pop_waits_for_push_and_ends_on_close() {
        let q = Arc::new(DeltaQueue::new());
        let q2 = Arc::clone(&q);
        let consumer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(p) = q2.pop().await {
                seen.push(p.delta.key().name.clone());
            }
            seen
        });
        tokio::task::yield_now().await;
        q.push(Delta::Added(obj("a", 1)));
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        q.push(Delta::Added(obj("b", 2)));
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        q.close();
        assert_eq!(consumer.await.unwrap(), vec!["a", "b"]);
    }
}
