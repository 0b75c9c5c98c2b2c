//! Lookout store: indexed object table, delta queue and read-only lister.

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use lookout_core::{Delta, IndexFn, Obj, ObjKey, ResourceVersion};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

mod lister;
mod queue;

pub use lister::{Lister, NamespaceLister};
pub use queue::{DeltaQueue, Popped};

/// Named index functions installed on a store.
pub type Indexers = Vec<(String, IndexFn)>;

/// Store transition produced by applying one delta.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Added(Arc<Obj>),
    Updated { old: Arc<Obj>, new: Arc<Obj> },
    /// `known` is false when the key was not in the store; `obj` is then the delta's snapshot.
    Deleted { obj: Arc<Obj>, known: bool },
    /// Current stored copy, unchanged.
    Synced(Arc<Obj>),
    /// Version token not newer than the stored one; nothing changed.
    Stale,
}

#[derive(Default)]
struct Inner {
    items: FxHashMap<ObjKey, Arc<Obj>>,
    // index name -> index value -> keys
    indices: FxHashMap<String, FxHashMap<String, FxHashSet<ObjKey>>>,
}

/// Keyed object table with secondary indexes. `apply` is the only mutator; items
/// and indexes change under one write lock so readers always see them agree.
pub struct IndexedStore {
    inner: RwLock<Inner>,
    indexers: Indexers,
}

impl Default for IndexedStore {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl IndexedStore {
    pub fn new(indexers: Indexers) -> Self {
        let mut inner = Inner::default();
        for (name, _) in indexers.iter() {
            inner.indices.insert(name.clone(), FxHashMap::default());
        }
        Self { inner: RwLock::new(inner), indexers }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn apply(&self, delta: &Delta) -> Applied {
        let mut inner = self.write();
        let key = delta.key().clone();
        let current = inner.items.get(&key).cloned();
        let out = match (delta, current) {
            (Delta::Added(o) | Delta::Updated(o), None) => {
                self.index_insert(&mut inner, o);
                inner.items.insert(key, Arc::clone(o));
                Applied::Added(Arc::clone(o))
            }
            (Delta::Added(o) | Delta::Updated(o), Some(old)) => {
                if o.version <= old.version {
                    Applied::Stale
                } else {
                    self.index_remove(&mut inner, &old);
                    self.index_insert(&mut inner, o);
                    inner.items.insert(key, Arc::clone(o));
                    Applied::Updated { old, new: Arc::clone(o) }
                }
            }
            (Delta::Deleted(o), None) => Applied::Deleted { obj: Arc::clone(o), known: false },
            (Delta::Deleted(o), Some(old)) => {
                if o.version < old.version {
                    Applied::Stale
                } else {
                    self.index_remove(&mut inner, &old);
                    inner.items.remove(&key);
                    Applied::Deleted { obj: old, known: true }
                }
            }
            (Delta::Synced(_), None) => Applied::Stale,
            (Delta::Synced(o), Some(cur)) => {
                if o.version < cur.version { Applied::Stale } else { Applied::Synced(cur) }
            }
        };
        drop(inner);
        if matches!(out, Applied::Stale) {
            debug!(key = %delta.key(), version = %delta.version(), kind = ?delta.kind(), "stale delta dropped");
            counter!("lookout_stale_dropped_total", 1u64);
        } else {
            counter!("lookout_deltas_applied_total", 1u64);
        }
        out
    }

    fn index_insert(&self, inner: &mut Inner, o: &Obj) {
        for (name, f) in self.indexers.iter() {
            let idx = inner.indices.entry(name.clone()).or_default();
            for value in f(o) {
                idx.entry(value).or_default().insert(o.key.clone());
            }
        }
    }

    fn index_remove(&self, inner: &mut Inner, o: &Obj) {
        for (name, f) in self.indexers.iter() {
            let Some(idx) = inner.indices.get_mut(name) else { continue };
            for value in f(o) {
                if let Some(set) = idx.get_mut(&value) {
                    set.remove(&o.key);
                    if set.is_empty() {
                        idx.remove(&value);
                    }
                }
            }
        }
    }

    pub fn get(&self, key: &ObjKey) -> Option<Arc<Obj>> {
        self.read().items.get(key).cloned()
    }

    pub fn version_of(&self, key: &ObjKey) -> Option<ResourceVersion> {
        self.read().items.get(key).map(|o| o.version)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexers.iter().any(|(n, _)| n == name)
    }

    /// Objects whose `index` function yields `value`, ordered by key. Unknown index: empty.
    pub fn by_index(&self, index: &str, value: &str) -> Vec<Arc<Obj>> {
        let inner = self.read();
        let Some(keys) = inner.indices.get(index).and_then(|idx| idx.get(value)) else {
            return Vec::new();
        };
        let mut out: Vec<Arc<Obj>> = keys.iter().filter_map(|k| inner.items.get(k).cloned()).collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn index_values(&self, index: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .read()
            .indices
            .get(index)
            .map(|idx| idx.keys().cloned().collect())
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    /// All objects ordered by key.
    pub fn list(&self) -> Vec<Arc<Obj>> {
        let mut out: Vec<Arc<Obj>> = self.read().items.values().cloned().collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Key to stored snapshot, for diffing against a fresh list.
    pub fn snapshot_map(&self) -> FxHashMap<ObjKey, Arc<Obj>> {
        self.read().items.clone()
    }

    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
