//! Background job: evict expired entries from the local token cache tier.
//!
//! Redis expires its own keys; the in-process map only drops an expired entry
//! when it is read again, so unread entries would otherwise pile up.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::cache::TieredCache;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the sweep task. Call this once at startup.
pub fn spawn(cache: TieredCache) -> JoinHandle<()> {
    spawn_with_interval(cache, SWEEP_INTERVAL)
}

pub fn spawn_with_interval(cache: TieredCache, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        loop {
            interval.tick().await;
            let evicted = cache.evict_expired();
            if evicted > 0 {
                tracing::debug!(evicted, remaining = cache.local_len(), "evicted expired cache entries");
            }
        }
    })
}
