//! Consumer callbacks and their isolated dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};

use anyhow::Result;
use lookout_core::{Delta, Obj};
use lookout_store::{Applied, IndexedStore};
use metrics::counter;
use tracing::{debug, error};

/// Receives store transitions. A returned error or a panic is logged and does not
/// affect other handlers or the processing loop.
pub trait EventHandler: Send + Sync {
    fn on_add(&self, _obj: &Arc<Obj>) -> Result<()> {
        Ok(())
    }

    /// Also invoked for resyncs, with `old` and `new` the same snapshot.
    fn on_update(&self, _old: &Arc<Obj>, _new: &Arc<Obj>) -> Result<()> {
        Ok(())
    }

    fn on_delete(&self, _obj: &Arc<Obj>) -> Result<()> {
        Ok(())
    }
}

type ObjFn = Box<dyn Fn(&Arc<Obj>) -> Result<()> + Send + Sync>;
type UpdateFn = Box<dyn Fn(&Arc<Obj>, &Arc<Obj>) -> Result<()> + Send + Sync>;

/// [`EventHandler`] assembled from optional closures.
#[derive(Default)]
pub struct HandlerFns {
    add: Option<ObjFn>,
    update: Option<UpdateFn>,
    delete: Option<ObjFn>,
}

impl HandlerFns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_add(mut self, f: impl Fn(&Arc<Obj>) -> Result<()> + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&Arc<Obj>, &Arc<Obj>) -> Result<()> + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&Arc<Obj>) -> Result<()> + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl EventHandler for HandlerFns {
    fn on_add(&self, obj: &Arc<Obj>) -> Result<()> {
        self.add.as_ref().map_or(Ok(()), |f| f(obj))
    }

    fn on_update(&self, old: &Arc<Obj>, new: &Arc<Obj>) -> Result<()> {
        self.update.as_ref().map_or(Ok(()), |f| f(old, new))
    }

    fn on_delete(&self, obj: &Arc<Obj>) -> Result<()> {
        self.delete.as_ref().map_or(Ok(()), |f| f(obj))
    }
}

#[derive(Debug, Clone)]
enum Notification {
    Add(Arc<Obj>),
    Update { old: Arc<Obj>, new: Arc<Obj> },
    Delete(Arc<Obj>),
}

impl Notification {
    fn from_applied(applied: &Applied) -> Option<Self> {
        match applied {
            Applied::Added(o) => Some(Self::Add(Arc::clone(o))),
            Applied::Updated { old, new } => Some(Self::Update { old: Arc::clone(old), new: Arc::clone(new) }),
            Applied::Synced(o) => Some(Self::Update { old: Arc::clone(o), new: Arc::clone(o) }),
            // delivered even when the key never reached the store, so handlers can release
            // anything tied to a coalesced add
            Applied::Deleted { obj, .. } => Some(Self::Delete(Arc::clone(obj))),
            Applied::Stale => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Update { .. } => "update",
            Self::Delete(_) => "delete",
        }
    }
}

/// Registered handlers, in registration order.
///
/// `dispatch` is held by the processing loop across one apply and its notifications,
/// and only ever taken with `try_lock` by registration. A handler registered while a
/// delta is in flight (including from inside a handler) waits in `pending` and is
/// installed by whoever holds `dispatch` next, before the following delta.
#[derive(Default)]
pub(crate) struct Handlers {
    active: RwLock<Vec<Arc<dyn EventHandler>>>,
    pending: Mutex<Vec<Arc<dyn EventHandler>>>,
    dispatch: Mutex<()>,
}

impl Handlers {
    /// Register `h`. It is first replayed `on_add` for every object already stored,
    /// then sees every later transition exactly once.
    pub(crate) fn register(&self, h: Arc<dyn EventHandler>, store: &IndexedStore) {
        self.lock_pending().push(h);
        self.drain_pending(store);
    }

    /// Apply `delta` to the store and notify every handler of the resulting transition.
    pub(crate) fn process(&self, store: &IndexedStore, delta: &Delta) -> Applied {
        let applied = {
            let _guard = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
            self.install_pending(store);
            let list: Vec<Arc<dyn EventHandler>> = self.active.read().unwrap_or_else(|e| e.into_inner()).clone();
            let applied = store.apply(delta);
            if let Some(n) = Notification::from_applied(&applied) {
                for (idx, h) in list.iter().enumerate() {
                    invoke(idx, h.as_ref(), &n);
                }
            }
            self.install_pending(store);
            applied
        };
        self.drain_pending(store);
        applied
    }

    // Install whatever is pending unless someone else holds `dispatch`; the holder then
    // installs it. Re-checked after each release so a registration that lost the race
    // just before it is not left waiting for the next delta.
    fn drain_pending(&self, store: &IndexedStore) {
        while !self.lock_pending().is_empty() {
            match self.try_dispatch() {
                Some(_guard) => self.install_pending(store),
                None => {
                    debug!("delta in flight; handler installs after it");
                    break;
                }
            }
        }
    }

    // Caller holds `dispatch`, so the store cannot change under the replay.
    fn install_pending(&self, store: &IndexedStore) {
        let fresh = std::mem::take(&mut *self.lock_pending());
        if fresh.is_empty() {
            return;
        }
        let existing = store.list();
        for h in fresh {
            let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
            let idx = active.len();
            active.push(Arc::clone(&h));
            drop(active);
            if !existing.is_empty() {
                debug!(handler = idx, count = existing.len(), "replaying existing objects to new handler");
            }
            for o in existing.iter() {
                invoke(idx, h.as_ref(), &Notification::Add(Arc::clone(o)));
            }
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<Arc<dyn EventHandler>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_dispatch(&self) -> Option<MutexGuard<'_, ()>> {
        match self.dispatch.try_lock() {
            Ok(g) => Some(g),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.active.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn invoke(idx: usize, h: &dyn EventHandler, n: &Notification) {
    let res = catch_unwind(AssertUnwindSafe(|| match n {
        Notification::Add(o) => h.on_add(o),
        Notification::Update { old, new } => h.on_update(old, new),
        Notification::Delete(o) => h.on_delete(o),
    }));
    let key = match n {
        Notification::Add(o) | Notification::Delete(o) => &o.key,
        Notification::Update { new, .. } => &new.key,
    };
    match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(handler = idx, event = n.name(), key = %key, error = %e, "handler failed");
            counter!("lookout_handler_failures_total", 1u64);
        }
        Err(panic) => {
            error!(handler = idx, event = n.name(), key = %key, panic = %panic_message(&panic), "handler panicked");
            counter!("lookout_handler_failures_total", 1u64);
        }
    }
}

fn panic_message(p: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
