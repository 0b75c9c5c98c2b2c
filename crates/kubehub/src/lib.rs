//! Lookout kubehub: kube-backed list/watch and a shared informer factory

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams, WatchEvent as KubeWatchEvent, WatchParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use lookout_cache::{wait_for_cache_sync, Cache, CacheConfig, CancellationToken};
use lookout_core::{ListOptions, ListWatch, ObjectList, SourceError, TweakListOptions, WatchEvent, WatchStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// apiserver rejects watch timeouts at or above this
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn map_kube_error(e: kube::Error) -> SourceError {
    match e {
        kube::Error::Api(resp) if resp.code == 410 => SourceError::Gone(resp.message),
        kube::Error::Api(resp) if resp.code >= 500 || resp.code == 429 => {
            SourceError::Transport(format!("{} ({})", resp.message, resp.code))
        }
        kube::Error::Api(resp) => SourceError::Rejected(format!("{} ({})", resp.message, resp.code)),
        kube::Error::SerdeError(e) => SourceError::Malformed(e.to_string()),
        other => SourceError::Transport(other.to_string()),
    }
}

fn to_raw(obj: DynamicObject) -> Result<serde_json::Value, SourceError> {
    serde_json::to_value(obj).map_err(|e| SourceError::Malformed(e.to_string()))
}

fn list_params(opts: &ListOptions) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(l) = opts.label_selector.as_deref() {
        lp = lp.labels(l);
    }
    if let Some(f) = opts.field_selector.as_deref() {
        lp = lp.fields(f);
    }
    if let Some(t) = opts.timeout_seconds {
        lp = lp.timeout(t);
    }
    lp
}

fn watch_params(opts: &ListOptions) -> WatchParams {
    let mut wp = WatchParams::default();
    if let Some(l) = opts.label_selector.as_deref() {
        wp = wp.labels(l);
    }
    if let Some(f) = opts.field_selector.as_deref() {
        wp = wp.fields(f);
    }
    if let Some(t) = opts.timeout_seconds {
        wp = wp.timeout(t.min(MAX_WATCH_TIMEOUT_SECS));
    }
    if !opts.allow_bookmarks {
        wp = wp.disable_bookmarks();
    }
    wp
}

/// [`ListWatch`] over one GVK, cluster-wide or in one namespace.
#[derive(Clone)]
pub struct KubeListWatch {
    api: Api<DynamicObject>,
    gvk_key: String,
}

impl KubeListWatch {
    pub fn new(api: Api<DynamicObject>, gvk_key: impl Into<String>) -> Self {
        Self { api, gvk_key: gvk_key.into() }
    }

    /// Resolve `gvk_key` via discovery. `namespace` is ignored for cluster-scoped kinds.
    pub async fn discover(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        debug!(gvk = %gvk_key, namespaced, ns = ?namespace, "resolved api resource");
        Ok(Self::new(api, gvk_key))
    }
}

#[async_trait]
impl ListWatch for KubeListWatch {
    async fn list(&self, opts: &ListOptions) -> Result<ObjectList, SourceError> {
        let list = self.api.list(&list_params(opts)).await.map_err(map_kube_error)?;
        let version = list
            .metadata
            .resource_version
            .ok_or_else(|| SourceError::Malformed(format!("{} list without resourceVersion", self.gvk_key)))?;
        let items = list.items.into_iter().map(to_raw).collect::<Result<Vec<_>, _>>()?;
        Ok(ObjectList { items, version })
    }

    async fn watch(&self, opts: &ListOptions) -> Result<WatchStream, SourceError> {
        let version = opts.resource_version.clone().unwrap_or_else(|| "0".to_string());
        let stream = self.api.watch(&watch_params(opts), &version).await.map_err(map_kube_error)?;
        let gvk_key = self.gvk_key.clone();
        let mapped = stream.map_err(map_kube_error).and_then(move |ev| {
            let out = match ev {
                KubeWatchEvent::Added(o) => to_raw(o).map(WatchEvent::Added),
                KubeWatchEvent::Modified(o) => to_raw(o).map(WatchEvent::Modified),
                KubeWatchEvent::Deleted(o) => to_raw(o).map(WatchEvent::Deleted),
                KubeWatchEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
                KubeWatchEvent::Error(resp) if resp.code == 410 => Err(SourceError::Gone(resp.message)),
                KubeWatchEvent::Error(resp) => {
                    warn!(gvk = %gvk_key, code = resp.code, reason = %resp.reason, "watch error event");
                    Err(SourceError::Transport(format!("{} ({})", resp.message, resp.code)))
                }
            };
            futures::future::ready(out)
        });
        Ok(mapped.boxed())
    }
}

/// One shared [`Cache`] per GVK key, all watching the same namespace (or all).
pub struct InformerFactory {
    client: Client,
    namespace: Option<String>,
    resync: Duration,
    tweak: Option<TweakListOptions>,
    informers: Mutex<BTreeMap<String, Arc<Cache>>>,
    running: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl InformerFactory {
    pub fn new(client: Client, resync: Duration) -> Self {
        Self {
            client,
            namespace: None,
            resync,
            tweak: None,
            informers: Mutex::new(BTreeMap::new()),
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Applied to every informer's list and watch requests.
    pub fn with_tweak(mut self, tweak: TweakListOptions) -> Self {
        self.tweak = Some(tweak);
        self
    }

    fn config(&self) -> CacheConfig {
        CacheConfig { namespace_index: true, ..CacheConfig::from_env() }.with_resync(self.resync)
    }

    /// Shared informer for `gvk_key`, created on first request. Informers requested
    /// after [`start`](Self::start) run on the next `start` call.
    pub async fn informer_for(&self, gvk_key: &str) -> Result<Arc<Cache>> {
        if let Some(c) = self.lock_informers().get(gvk_key) {
            return Ok(Arc::clone(c));
        }
        let lw = KubeListWatch::discover(self.client.clone(), gvk_key, self.namespace.as_deref()).await?;
        let mut cache = Cache::new(Arc::new(lw), self.config());
        if let Some(t) = &self.tweak {
            cache = cache.with_tweak(Arc::clone(t));
        }
        let mut informers = self.lock_informers();
        // lost a race with a concurrent request for the same kind: keep the first
        let shared = informers.entry(gvk_key.to_string()).or_insert_with(|| Arc::new(cache));
        Ok(Arc::clone(shared))
    }

    /// Spawn every informer not yet running.
    pub fn start(&self, stop: &CancellationToken) {
        let informers = self.lock_informers().clone();
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        for (key, cache) in informers {
            if running.iter().any(|(k, _)| *k == key) {
                continue;
            }
            info!(gvk = %key, ns = ?self.namespace, "starting informer");
            let stop = stop.clone();
            let handle = tokio::spawn(async move { cache.run(stop).await });
            running.push((key, handle));
        }
    }

    /// Wait for every started informer; returns each one's sync state.
    pub async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> BTreeMap<String, bool> {
        let started: Vec<(String, Arc<Cache>)> = {
            let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            let informers = self.lock_informers();
            running
                .iter()
                .filter_map(|(k, _)| informers.get(k).map(|c| (k.clone(), Arc::clone(c))))
                .collect()
        };
        let caches: Vec<&Cache> = started.iter().map(|(_, c)| c.as_ref()).collect();
        wait_for_cache_sync(stop, &caches).await;
        started.iter().map(|(k, c)| (k.clone(), c.has_synced())).collect()
    }

    /// Wait for started informers to exit, normally after `stop` fired.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.running.lock().unwrap_or_else(|e| e.into_inner()));
        for (key, h) in handles {
            if let Err(e) = h.await {
                warn!(gvk = %key, error = %e, "informer task failed");
            }
        }
    }

    fn lock_informers(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Arc<Cache>>> {
        self.informers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys() {
        let core = parse_gvk_key("v1/ConfigMap").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "ConfigMap"));
        let crd = parse_gvk_key("cert-manager.io/v1/Certificate").unwrap();
        assert_eq!(crd.group, "cert-manager.io");
        assert!(parse_gvk_key("ConfigMap").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
        assert!(parse_gvk_key("v1/").is_err());
    }

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "m".into(),
            reason: "r".into(),
            code,
        })
    }

    #[test]
    fn error_mapping() {
        assert!(map_kube_error(api_err(410)).is_gone());
        assert!(matches!(map_kube_error(api_err(403)), SourceError::Rejected(_)));
        assert!(matches!(map_kube_error(api_err(503)), SourceError::Transport(_)));
        assert!(matches!(map_kube_error(api_err(429)), SourceError::Transport(_)));
    }

    #[test]
    fn options_carry_selectors_and_clamp_timeout() {
        let opts = ListOptions {
            label_selector: Some("app=web".into()),
            field_selector: Some("metadata.name=x".into()),
            timeout_seconds: Some(3600),
            allow_bookmarks: false,
            ..ListOptions::default()
        };
        let wp = watch_params(&opts);
        assert_eq!(wp.label_selector.as_deref(), Some("app=web"));
        assert_eq!(wp.field_selector.as_deref(), Some("metadata.name=x"));
        assert_eq!(wp.timeout, Some(MAX_WATCH_TIMEOUT_SECS));
        assert!(!wp.bookmarks);
        let lp = list_params(&opts);
        assert_eq!(lp.label_selector.as_deref(), Some("app=web"));
    }
}
