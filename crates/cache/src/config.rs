use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

/// Runtime knobs for a [`Cache`](crate::Cache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Interval between synthetic resyncs; zero disables them.
    pub resync: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Server-side timeout requested for each watch connection.
    pub watch_timeout_secs: Option<u32>,
    /// Install the namespace index on the store.
    pub namespace_index: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            resync: Duration::ZERO,
            backoff_initial: Duration::from_millis(800),
            backoff_max: Duration::from_secs(30),
            watch_timeout_secs: Some(290),
            namespace_index: true,
        }
    }
}

impl CacheConfig {
    /// Defaults overridden by `LOOKOUT_RESYNC_SECS`, `LOOKOUT_WATCH_BACKOFF_MAX_SECS`
    /// and `LOOKOUT_WATCH_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(s) = env_u64("LOOKOUT_RESYNC_SECS") {
            cfg.resync = Duration::from_secs(s);
        }
        if let Some(s) = env_u64("LOOKOUT_WATCH_BACKOFF_MAX_SECS") {
            cfg.backoff_max = Duration::from_secs(s.max(1));
        }
        if let Some(s) = env_u64("LOOKOUT_WATCH_TIMEOUT_SECS") {
            cfg.watch_timeout_secs = if s == 0 { None } else { Some(s.min(u32::MAX as u64) as u32) };
        }
        cfg
    }

    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    pub(crate) fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.backoff_initial)
            .with_max_interval(self.backoff_max.max(self.backoff_initial))
            .with_max_elapsed_time(None)
            .build()
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<u64>().ok())
}
