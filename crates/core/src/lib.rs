//! Lookout core types: tracked objects, deltas and the list/watch contract.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod source;

pub use source::{ListOptions, ListWatch, ObjectList, SourceError, TweakListOptions, WatchEvent, WatchStream};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("object missing metadata.{0}")]
    MissingField(&'static str),
    #[error("invalid resourceVersion {0:?}")]
    BadVersion(String),
    #[error("invalid key {0:?}")]
    BadKey(String),
}

/// Remote-assigned, monotonically increasing version token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceVersion(pub u64);

impl ResourceVersion {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        s.trim().parse::<u64>().map(Self).map_err(|_| CoreError::BadVersion(s.to_string()))
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a tracked object: `namespace/name`, or `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjKey {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self { namespace: Some(namespace.to_string()), name: name.to_string() }
    }

    pub fn cluster(name: &str) -> Self {
        Self { namespace: None, name: name.to_string() }
    }

    pub fn parse(key: &str) -> Result<Self, CoreError> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::namespaced(ns, name)),
            _ => Err(CoreError::BadKey(key.to_string())),
        }
    }
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

pub type Labels = SmallVec<[(String, String); 8]>;

/// A versioned snapshot of one remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obj {
    pub key: ObjKey,
    pub version: ResourceVersion,
    pub uid: Option<String>,
    /// Seconds since epoch; 0 when the remote did not report one.
    pub creation_ts: i64,
    /// Labels sorted by key.
    pub labels: Labels,
    /// Raw object with `metadata.managedFields` stripped.
    pub raw: serde_json::Value,
}

impl Obj {
    /// Build from a raw remote object. Fails when the object cannot be keyed or versioned.
    pub fn from_raw(mut raw: serde_json::Value) -> Result<Self, CoreError> {
        strip_managed_fields(&mut raw);
        let meta = raw.get("metadata").ok_or(CoreError::MissingField("metadata"))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(CoreError::MissingField("name"))?
            .to_string();
        let namespace = meta
            .get("namespace")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let version = meta
            .get("resourceVersion")
            .and_then(|v| v.as_str())
            .ok_or(CoreError::MissingField("resourceVersion"))
            .and_then(ResourceVersion::parse)?;
        let uid = meta.get("uid").and_then(|v| v.as_str()).map(|s| s.to_string());
        let creation_ts = meta
            .get("creationTimestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        let mut labels: Labels = meta
            .get("labels")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        labels.sort_unstable();
        Ok(Self { key: ObjKey { namespace, name }, version, uid, creation_ts, labels, raw })
    }

    pub fn namespace(&self) -> Option<&str> {
        self.key.namespace.as_deref()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// True when every `(key, value)` pair is present among the labels.
    pub fn matches_labels(&self, selector: &[(&str, &str)]) -> bool {
        selector.iter().all(|(k, v)| self.label(k) == Some(*v))
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    Synced,
}

/// A queued change notification carrying the object snapshot it refers to.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Added(Arc<Obj>),
    Updated(Arc<Obj>),
    Deleted(Arc<Obj>),
    /// Periodic re-delivery of current state; never a state change.
    Synced(Arc<Obj>),
}

impl Delta {
    pub fn kind(&self) -> DeltaKind {
        match self {
            Delta::Added(_) => DeltaKind::Added,
            Delta::Updated(_) => DeltaKind::Updated,
            Delta::Deleted(_) => DeltaKind::Deleted,
            Delta::Synced(_) => DeltaKind::Synced,
        }
    }

    pub fn obj(&self) -> &Arc<Obj> {
        match self {
            Delta::Added(o) | Delta::Updated(o) | Delta::Deleted(o) | Delta::Synced(o) => o,
        }
    }

    pub fn key(&self) -> &ObjKey {
        &self.obj().key
    }

    pub fn version(&self) -> ResourceVersion {
        self.obj().version
    }
}

/// Extracts zero or more index values from an object.
pub type IndexFn = Arc<dyn Fn(&Obj) -> SmallVec<[String; 2]> + Send + Sync>;

pub const NAMESPACE_INDEX: &str = "namespace";

/// Indexes by namespace; cluster-scoped objects land under the empty string.
pub fn namespace_index_fn() -> IndexFn {
    Arc::new(|o: &Obj| {
        let mut out = SmallVec::new();
        out.push(o.namespace().unwrap_or("").to_string());
        out
    })
}

pub mod prelude {
    pub use super::{
        namespace_index_fn, Delta, DeltaKind, IndexFn, ListOptions, ListWatch, Obj, ObjKey, ObjectList,
        ResourceVersion, SourceError, WatchEvent, WatchStream, NAMESPACE_INDEX,
    };
}
