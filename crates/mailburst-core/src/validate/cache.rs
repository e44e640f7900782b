//! Shared domain-verdict cache with time-to-live

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cached MX liveness verdict for a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainVerdict {
    HasMx,
    NoMx,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    verdict: DomainVerdict,
    expires_at: DateTime<Utc>,
}

/// Domain -> (verdict, expiry) map shared read/write across all jobs and
/// tenants; domain validity is not tenant-specific.
///
/// Only definitive verdicts are stored. Lookup errors are never cached, so
/// a transient resolver outage cannot be served as a verdict for a full
/// TTL window. A redundant lookup under concurrent misses is tolerated.
#[derive(Clone)]
pub struct DomainCache {
    inner: Arc<RwLock<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl DomainCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn with_ttl_hours(hours: i64) -> Self {
        Self::new(Duration::hours(hours))
    }

    /// Look up a domain; expired entries are treated as absent.
    pub async fn get(&self, domain: &str) -> Option<DomainVerdict> {
        let map = self.inner.read().await;
        map.get(&domain.to_ascii_lowercase())
            .filter(|entry| entry.expires_at > Utc::now())
            .map(|entry| entry.verdict)
    }

    pub async fn insert(&self, domain: &str, verdict: DomainVerdict) {
        let mut map = self.inner.write().await;
        map.insert(
            domain.to_ascii_lowercase(),
            CacheEntry {
                verdict,
                expires_at: Utc::now() + self.ttl,
            },
        );
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn prune_expired(&self) -> usize {
        let mut map = self.inner.write().await;
        let before = map.len();
        let now = Utc::now();
        map.retain(|_, entry| entry.expires_at > now);
        before - map.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
