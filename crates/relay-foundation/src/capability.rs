//! TTL cache of per-domain capability descriptors.
//!
//! Reads of a fresh entry never touch a worker. When an entry is missing or
//! expired, one caller per domain refreshes it while the others wait for
//! that refresh instead of issuing their own.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use relay_kernel::DomainType;
use relay_kernel::error::EngineResult;
use relay_kernel::metrics::CapabilityEntryInfo;

struct CachedCapability {
    payload: Value,
    cached_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    expires: Instant,
    access_count: AtomicU64,
}

impl CachedCapability {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires
    }
}

pub struct CapabilityCache {
    ttl: Duration,
    entries: DashMap<DomainType, Arc<CachedCapability>>,
    refresh_locks: DashMap<DomainType, Arc<tokio::sync::Mutex<()>>>,
    refreshes: AtomicU64,
}

impl CapabilityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            refresh_locks: DashMap::new(),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached payload if it has not expired.
    pub fn get_fresh(&self, domain: DomainType) -> Option<Value> {
        let entry = self.entries.get(&domain).map(|e| Arc::clone(e.value()))?;
        if entry.is_fresh() {
            entry.access_count.fetch_add(1, Ordering::Relaxed);
            Some(entry.payload.clone())
        } else {
            None
        }
    }

    /// Return the fresh payload for `domain`, calling `fetch` to refresh it
    /// when missing or expired. Failed fetches are not cached.
    pub async fn get_or_refresh<F, Fut>(&self, domain: DomainType, fetch: F) -> EngineResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<Value>>,
    {
        if let Some(payload) = self.get_fresh(domain) {
            return Ok(payload);
        }

        let lock = Arc::clone(self.refresh_locks.entry(domain).or_default().value());
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(payload) = self.get_fresh(domain) {
            return Ok(payload);
        }

        debug!("Refreshing {} capabilities", domain);
        let payload = fetch().await?;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let cached_at = Utc::now();
        self.entries.insert(
            domain,
            Arc::new(CachedCapability {
                payload: payload.clone(),
                cached_at,
                expires_at: cached_at
                    + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero()),
                expires: Instant::now() + self.ttl,
                access_count: AtomicU64::new(1),
            }),
        );
        Ok(payload)
    }

    /// Drop the entry for `domain`. Returns whether one existed.
    pub fn invalidate(&self, domain: DomainType) -> bool {
        self.entries.remove(&domain).is_some()
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    /// How many times a worker was actually asked.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Fresh entries, ordered by domain.
    pub fn entries(&self) -> Vec<CapabilityEntryInfo> {
        let mut entries: Vec<CapabilityEntryInfo> = self
            .entries
            .iter()
            .filter(|e| e.value().is_fresh())
            .map(|e| {
                let entry = e.value();
                CapabilityEntryInfo {
                    domain: *e.key(),
                    cached_at: entry.cached_at,
                    expires_at: entry.expires_at,
                    access_count: entry.access_count.load(Ordering::Relaxed),
                }
            })
            .collect();
        entries.sort_by_key(|e| e.domain);
        entries
    }
}
