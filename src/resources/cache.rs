use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use rpc_lite::{BoxError, Resource};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RedisConfig;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache connection is closed")]
    Closed,
}

/// Shortest pause between expiry sweeps.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

struct Entry {
    value: Bytes,
    expires_at: Instant,
}

type Entries = DashMap<String, Entry, ahash::RandomState>;

/// Key/value cache handle with a fixed entry lifetime.
///
/// Expired entries are dropped on read and by a background sweep that runs
/// once per TTL, so keys that are never read again do not pile up.
pub struct Cache {
    host: String,
    ttl: Duration,
    entries: Arc<Entries>,
    closed: AtomicBool,
    sweeper: CancellationToken,
}

impl Cache {
    pub async fn connect(config: &RedisConfig) -> Result<Self, BoxError> {
        if config.host.rsplit_once(':').is_none() {
            return Err(format!("cache host '{}' must be host:port", config.host).into());
        }

        info!(host = %config.host, ttl_secs = config.ttl_secs, "Connected to cache");
        Ok(Self::with_ttl(
            config.host.clone(),
            Duration::from_secs(config.ttl_secs),
        ))
    }

    /// Outside a tokio runtime no sweep runs and expiry happens on read only.
    pub fn with_ttl(host: impl Into<String>, ttl: Duration) -> Self {
        let entries: Arc<Entries> = Arc::new(DashMap::default());
        let sweeper = CancellationToken::new();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(sweep(
                    Arc::clone(&entries),
                    ttl.max(MIN_SWEEP_INTERVAL),
                    sweeper.clone(),
                ));
            }
            Err(_) => debug!("No runtime, cache expiry sweep disabled"),
        }

        Self {
            host: host.into(),
            ttl,
            entries,
            closed: AtomicBool::new(false),
            sweeper,
        }
    }

    /// Fetch a live entry. Expired entries are evicted on read.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        self.ensure_open()?;

        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    pub async fn set(&self, key: impl Into<String>, value: Bytes) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<bool, CacheError> {
        self.ensure_open()?;
        Ok(self.entries.remove(key).is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.sweeper.cancel();
            self.entries.clear();
            info!(host = %self.host, "Cache connection closed");
        }
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.is_closed() {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

async fn sweep(entries: Arc<Entries>, every: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                let before = entries.len();
                entries.retain(|_, entry| entry.expires_at > now);
                let evicted = before.saturating_sub(entries.len());
                if evicted > 0 {
                    debug!(evicted, "Swept expired cache entries");
                }
            }
        }
    }
}

impl Resource for Cache {
    fn name(&self) -> &str {
        "cache"
    }

    fn release(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        async move {
            self.close();
            Ok(())
        }
        .boxed()
    }
}
