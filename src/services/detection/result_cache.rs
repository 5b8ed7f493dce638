// Result Cache
// Short-TTL memo of normalized text -> guard verdict. Acknowledged warnings
// are single-use: the lookup that returns one also deletes it.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::models::{CacheEntry, CacheMode};
use crate::services::config_store::GuardConfig;

pub struct ResultCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl ResultCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn from_config(config: &GuardConfig) -> Self {
        let ttl_secs = i64::try_from(config.cache_ttl_secs).unwrap_or(i64::MAX / 1000);
        Self::new(Duration::seconds(ttl_secs), config.cache_capacity)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.timestamp >= self.ttl
    }

    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        self.lookup_at(key, Utc::now())
    }

    /// Expired entries are misses (and are dropped). A `WarningAcknowledged`
    /// entry is removed in the same critical section that returns it.
    pub fn lookup_at(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let mut entries = self.lock();
        let entry = entries.get(key)?;
        if self.is_expired(entry, now) {
            entries.remove(key);
            return None;
        }
        if entry.mode == CacheMode::WarningAcknowledged {
            debug!("[result_cache] Consuming acknowledged warning");
            return entries.remove(key);
        }
        Some(entry.clone())
    }

    pub fn put(&self, key: &str, mode: CacheMode, converted_text: Option<String>) {
        self.put_at(key, mode, converted_text, Utc::now());
    }

    pub fn put_at(&self, key: &str, mode: CacheMode, converted_text: Option<String>, now: DateTime<Utc>) {
        if key.is_empty() {
            return;
        }
        let mut entries = self.lock();
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            let ttl = self.ttl;
            entries.retain(|_, e| now - e.timestamp < ttl);
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.timestamp)
                    .map(|(k, _)| k.clone());
                if let Some(k) = oldest {
                    entries.remove(&k);
                }
            }
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                mode,
                converted_text,
                timestamp: now,
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.ttl;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| now - e.timestamp < ttl);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn cache() -> ResultCache {
        ResultCache::from_config(&GuardConfig::default())
    }

    #[test]
    fn test_ttl_boundary() {
        let c = cache();
        let t = Utc::now();
        c.put_at("key", CacheMode::Send, None, t);
        assert!(c.lookup_at("key", t + Duration::seconds(89)).is_some());
        assert!(c.lookup_at("key", t + Duration::seconds(91)).is_none());
        // Expired entries are dropped on lookup
        assert!(c.is_empty());
    }

    #[test]
    fn test_acknowledged_warning_is_single_use() {
        let c = cache();
        let t = Utc::now();
        c.put_at("key", CacheMode::WarningAcknowledged, None, t);
        let first = c.lookup_at("key", t).unwrap();
        assert_eq!(first.mode, CacheMode::WarningAcknowledged);
        assert!(c.lookup_at("key", t).is_none());
    }

    #[test]
    fn test_convert_entry_keeps_text_and_survives_lookup() {
        let c = cache();
        let t = Utc::now();
        c.put_at("key", CacheMode::Convert, Some("정중한 문장".to_string()), t);
        assert_eq!(c.lookup_at("key", t).unwrap().converted_text.as_deref(), Some("정중한 문장"));
        assert!(c.lookup_at("key", t).is_some());
    }

    #[test]
    fn test_empty_key_is_not_cached() {
        let c = cache();
        c.put("", CacheMode::Send, None);
        assert!(c.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let c = ResultCache::new(Duration::seconds(90), 2);
        let t = Utc::now();
        c.put_at("a", CacheMode::Send, None, t);
        c.put_at("b", CacheMode::Send, None, t + Duration::seconds(1));
        c.put_at("c", CacheMode::Send, None, t + Duration::seconds(2));
        assert_eq!(c.len(), 2);
        assert!(c.lookup_at("a", t + Duration::seconds(2)).is_none());
        assert!(c.lookup_at("c", t + Duration::seconds(2)).is_some());
    }

    #[test]
    fn test_purge_expired() {
        let c = cache();
        let t = Utc::now();
        c.put_at("old", CacheMode::Send, None, t);
        c.put_at("new", CacheMode::Send, None, t + Duration::seconds(60));
        assert_eq!(c.purge_expired_at(t + Duration::seconds(100)), 1);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_concurrent_consumers_get_acknowledgement_once() {
        let c = Arc::new(cache());
        let t = Utc::now();
        c.put_at("key", CacheMode::WarningAcknowledged, None, t);

        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if c.lookup_at("key", t).is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
