//! Read-through cache for product listings and transaction reports
//!
//! Cache failures never fail a request: reads degrade to a miss and writes
//! or evictions are logged and dropped. A service built without a cache
//! (`None`) simply always goes to the store.

use crate::errors::Result;
use crate::metrics::{CACHE_EVICTIONS, CACHE_HITS, CACHE_MISSES};
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::models::DATE_LAYOUT;

/// Cache TTLs
pub mod ttl {
    use std::time::Duration;

    pub const PRODUCT_LISTING: Duration = Duration::from_secs(300); // 5 minutes
    pub const REPORT: Duration = Duration::from_secs(120); // 2 minutes
}

/// Cache key layout
pub mod keys {
    use super::*;

    pub const PRODUCT_DATE_PREFIX: &str = "products:date:";
    pub const REPORT_PREFIX: &str = "report:transactions:";

    pub fn product_listing(date: NaiveDate) -> String {
        format!("{}{}", PRODUCT_DATE_PREFIX, date.format(DATE_LAYOUT))
    }

    /// Keyed by the caller's trimmed date strings, not the parsed dates
    pub fn report(start: &str, end: &str) -> String {
        format!("{}{}:{}", REPORT_PREFIX, start.trim(), end.trim())
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every key starting with `prefix`, returning how many were removed
    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64>;
}

/// Redis-backed cache
#[derive(Clone)]
pub struct RedisCache {
    redis: ConnectionManager,
}

impl RedisCache {
    const SCAN_BATCH: usize = 100;

    pub fn new(redis: ConnectionManager) -> Self {
        RedisCache { redis }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::new(manager))
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.redis.clone().get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let _: () = self
            .redis
            .clone()
            .set_ex(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _: () = self.redis.clone().del(key).await?;
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut removed = 0u64;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(Self::SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !batch.is_empty() {
                let deleted: u64 = conn.del(&batch).await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }
}

/// Process-local cache with per-entry expiry
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.1 > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if entry.1 > now => Some(entry.0.clone()),
            Some(_) => None,
            None => return Ok(None),
        };

        if value.is_none() {
            self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }
}

/// Cached value for `key`, `None` on a miss or any cache failure
pub async fn fetch_cached<T: DeserializeOwned>(cache: Option<&dyn Cache>, key: &str) -> Option<T> {
    let cache = cache?;

    match cache.get(key).await {
        Ok(Some(json)) => match serde_json::from_str(&json) {
            Ok(value) => {
                CACHE_HITS.inc();
                debug!(key, "cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(key, "Failed to deserialize cached value: {}", e);
                CACHE_MISSES.inc();
                None
            }
        },
        Ok(None) => {
            CACHE_MISSES.inc();
            None
        }
        Err(e) => {
            warn!(key, "Cache read failed: {}", e);
            CACHE_MISSES.inc();
            None
        }
    }
}

pub async fn populate<T: Serialize>(cache: Option<&dyn Cache>, key: &str, value: &T, ttl: Duration) {
    let Some(cache) = cache else {
        return;
    };

    let json = match serde_json::to_string(value) {
        Ok(json) => json,
        Err(e) => {
            warn!(key, "Failed to serialize value for cache: {}", e);
            return;
        }
    };

    if let Err(e) = cache.set(key, json, ttl).await {
        warn!(key, "Cache write failed: {}", e);
    }
}

pub async fn evict(cache: Option<&dyn Cache>, key: &str) {
    let Some(cache) = cache else {
        return;
    };

    match cache.delete(key).await {
        Ok(()) => CACHE_EVICTIONS.inc(),
        Err(e) => warn!(key, "Cache eviction failed: {}", e),
    }
}

pub async fn evict_prefix(cache: Option<&dyn Cache>, prefix: &str) {
    let Some(cache) = cache else {
        return;
    };

    match cache.delete_by_prefix(prefix).await {
        Ok(removed) => {
            CACHE_EVICTIONS.inc_by(removed);
            debug!(prefix, removed, "evicted cache entries by prefix");
        }
        Err(e) => warn!(prefix, "Cache prefix eviction failed: {}", e),
    }
}
