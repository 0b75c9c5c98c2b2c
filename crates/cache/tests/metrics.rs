#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use lookout_cache::{Cache, CacheConfig, CancellationToken};
use lookout_core::{ListOptions, ListWatch, ObjectList, SourceError, WatchEvent, WatchStream};
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Recorder, SharedString, Unit};
use serde_json::json;

/// Keeps counter totals by name; gauges and histograms are ignored.
#[derive(Default)]
struct Counters(Mutex<HashMap<String, Arc<AtomicU64>>>);

impl Counters {
    fn get(&self, name: &str) -> u64 {
        self.0.lock().unwrap().get(name).map(|c| c.load(Ordering::Acquire)).unwrap_or(0)
    }
}

impl Recorder for &'static Counters {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key) -> Counter {
        let c = Arc::clone(self.0.lock().unwrap().entry(key.name().to_string()).or_default());
        Counter::from_arc(c)
    }

    fn register_gauge(&self, _: &Key) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, _: &Key) -> Histogram {
        Histogram::noop()
    }
}

/// One list, then a watch that ends cleanly after one event, then watches that hang.
#[derive(Default)]
struct OneReopen {
    watches: AtomicUsize,
}

#[async_trait::async_trait]
impl ListWatch for OneReopen {
    async fn list(&self, _: &ListOptions) -> Result<ObjectList, SourceError> {
        let a = json!({ "metadata": { "name": "a", "namespace": "ns", "resourceVersion": "1" } });
        Ok(ObjectList { items: vec![a], version: "1".to_string() })
    }

    async fn watch(&self, _: &ListOptions) -> Result<WatchStream, SourceError> {
        if self.watches.fetch_add(1, Ordering::SeqCst) == 0 {
            let a = json!({ "metadata": { "name": "a", "namespace": "ns", "resourceVersion": "2" } });
            Ok(stream::iter(vec![Ok(WatchEvent::Modified(a))]).boxed())
        } else {
            Ok(stream::pending().boxed())
        }
    }
}

#[tokio::test(start_paused = true)]
async fn watch_opens_counts_every_open_including_the_first() {
    let counters: &'static Counters = Box::leak(Box::default());
    metrics::set_boxed_recorder(Box::new(counters)).unwrap();

    let source = Arc::new(OneReopen::default());
    let cache = Arc::new(Cache::new(source.clone(), CacheConfig::default()));
    let stop = CancellationToken::new();
    let task = {
        let (cache, stop) = (Arc::clone(&cache), stop.clone());
        tokio::spawn(async move { cache.run(stop).await })
    };

    for _ in 0..1_000 {
        if source.watches.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(source.watches.load(Ordering::SeqCst), 2);
    assert_eq!(counters.get("lookout_watch_opens_total"), 2);
    assert_eq!(counters.get("lookout_watch_restarts_total"), 0);

    stop.cancel();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}
