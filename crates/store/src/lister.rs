use std::sync::Arc;

use lookout_core::{Obj, ObjKey, NAMESPACE_INDEX};

use crate::IndexedStore;

/// Read-only query facade over an [`IndexedStore`]. Cheap to clone.
#[derive(Clone)]
pub struct Lister {
    store: Arc<IndexedStore>,
}

impl Lister {
    pub fn new(store: Arc<IndexedStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, key: &ObjKey) -> Option<Arc<Obj>> {
        self.store.get(key)
    }

    /// Objects in the namespace `index_value` (the default index).
    pub fn list(&self, index_value: &str) -> Vec<Arc<Obj>> {
        self.namespaced(index_value).list()
    }

    pub fn list_by_index(&self, index: &str, value: &str) -> Vec<Arc<Obj>> {
        self.store.by_index(index, value)
    }

    pub fn list_all(&self) -> Vec<Arc<Obj>> {
        self.store.list()
    }

    /// Objects carrying every given label.
    pub fn list_matching(&self, selector: &[(&str, &str)]) -> Vec<Arc<Obj>> {
        self.store.list().into_iter().filter(|o| o.matches_labels(selector)).collect()
    }

    pub fn namespaced(&self, namespace: &str) -> NamespaceLister {
        NamespaceLister { store: Arc::clone(&self.store), namespace: namespace.to_string() }
    }
}

/// Lister scoped to a single namespace.
#[derive(Clone)]
pub struct NamespaceLister {
    store: Arc<IndexedStore>,
    namespace: String,
}

impl NamespaceLister {
    pub fn get(&self, name: &str) -> Option<Arc<Obj>> {
        self.store.get(&ObjKey::namespaced(&self.namespace, name))
    }

    pub fn list(&self) -> Vec<Arc<Obj>> {
        if self.store.has_index(NAMESPACE_INDEX) {
            return self.store.by_index(NAMESPACE_INDEX, &self.namespace);
        }
        // no namespace index installed: scan
        self.store
            .list()
            .into_iter()
            .filter(|o| o.namespace().unwrap_or("") == self.namespace)
            .collect()
    }

    pub fn list_matching(&self, selector: &[(&str, &str)]) -> Vec<Arc<Obj>> {
        self.list().into_iter().filter(|o| o.matches_labels(selector)).collect()
    }
}
