//! Key-value persistence for rule definitions, window snapshots and metric
//! summaries. Any store with TTL support can back the engine; without one
//! it runs in memory only.

use crate::alerts::AlertRule;
use crate::clock::{SharedClock, SystemClock};
use crate::error::{LivewireError, Result};
use crate::window::WindowSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub const RULES_KEY: &str = "analytics_alert_rules";
pub const METRICS_KEY: &str = "realtime_analytics_metrics";
pub const SNAPSHOT_KEY_PREFIX: &str = "window_snapshot:";

pub const RULES_TTL: Duration = Duration::from_secs(86_400);
pub const METRICS_TTL: Duration = Duration::from_secs(300);
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(86_400);

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size: usize,
}

/// In-process store with per-key TTL and least-recently-used eviction.
#[derive(Debug)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredValue>>,
    stats: RwLock<StoreStats>,
    max_entries: usize,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self::with_clock(max_entries, Arc::new(SystemClock))
    }

    pub fn with_clock(max_entries: usize, clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(StoreStats::default()),
            max_entries: max_entries.max(1),
            clock,
        }
    }

    pub fn stats(&self) -> StoreStats {
        *self.stats.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, v| v.expires_at > now);
        let removed = before - entries.len();
        self.stats.write().unwrap_or_else(|e| e.into_inner()).current_size = entries.len();
        removed
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());

        let found = match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_accessed = now;
                Some(entry.bytes.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };
        match found {
            Some(_) => stats.hits += 1,
            None => stats.misses += 1,
        }
        stats.current_size = entries.len();
        Ok(found)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| LivewireError::persistence(format!("invalid ttl: {}", e)))?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());

        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, v)| v.last_accessed)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                stats.evictions += 1;
            }
        }
        entries.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at: now + ttl,
                last_accessed: now,
            },
        );
        stats.current_size = entries.len();
        Ok(())
    }
}

/// Typed access to the keys the engine persists. Every operation is a no-op
/// when no store is configured.
#[derive(Clone)]
pub struct Persistence {
    store: Option<Arc<dyn KeyValueStore>>,
}

impl Persistence {
    pub fn new(store: Option<Arc<dyn KeyValueStore>>) -> Self {
        if store.is_none() {
            tracing::warn!("No persistence store configured, running in memory only");
        }
        Self { store }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        match store.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.set(key, serde_json::to_vec(value)?, ttl).await
    }

    pub async fn load_rules(&self) -> Result<Option<Vec<AlertRule>>> {
        self.get_json(RULES_KEY).await
    }

    pub async fn save_rules(&self, rules: &[AlertRule]) -> Result<()> {
        self.set_json(RULES_KEY, &rules, RULES_TTL).await
    }

    pub async fn load_snapshot(&self, window: &str) -> Result<Option<WindowSnapshot>> {
        self.get_json(&format!("{}{}", SNAPSHOT_KEY_PREFIX, window)).await
    }

    pub async fn save_snapshot(&self, snapshot: &WindowSnapshot) -> Result<()> {
        self.set_json(
            &format!("{}{}", SNAPSHOT_KEY_PREFIX, snapshot.name),
            snapshot,
            SNAPSHOT_TTL,
        )
        .await
    }

    pub async fn save_metrics<T: Serialize + Sync>(&self, summary: &T) -> Result<()> {
        self.set_json(METRICS_KEY, summary, METRICS_TTL).await
    }

    pub async fn load_metrics(&self) -> Result<Option<serde_json::Value>> {
        self.get_json(METRICS_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::default_rules;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let clock = ManualClock::default();
        let store = MemoryStore::with_clock(10, Arc::new(clock.clone()));
        store.set("k", b"v".to_vec(), Duration::from_secs(300)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        clock.advance_secs(301);
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.stats().hits, 1);
        assert_eq!(store.stats().misses, 1);
    }

    #[tokio::test]
    async fn sweep_drops_only_expired_entries() {
        let clock = ManualClock::default();
        let store = MemoryStore::with_clock(10, Arc::new(clock.clone()));
        store.set("short", vec![1], Duration::from_secs(10)).await.unwrap();
        store.set("long", vec![2], Duration::from_secs(600)).await.unwrap();

        clock.advance_secs(11);
        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.stats().current_size, 1);
        assert_eq!(store.cleanup_expired(), 0);
    }

    #[tokio::test]
    async fn least_recently_used_is_evicted() {
        let clock = ManualClock::default();
        let store = MemoryStore::with_clock(2, Arc::new(clock.clone()));
        store.set("a", vec![1], Duration::from_secs(60)).await.unwrap();
        clock.advance_secs(1);
        store.set("b", vec![2], Duration::from_secs(60)).await.unwrap();
        clock.advance_secs(1);
        store.get("a").await.unwrap();
        store.set("c", vec![3], Duration::from_secs(60)).await.unwrap();

        assert!(store.get("b").await.unwrap().is_none());
        assert!(store.get("a").await.unwrap().is_some());
        assert_eq!(store.stats().evictions, 1);
    }

    #[tokio::test]
    async fn rules_roundtrip_through_store() {
        let persistence = Persistence::new(Some(Arc::new(MemoryStore::new(16))));
        let rules = default_rules(&["log".to_string()]);
        persistence.save_rules(&rules).await.unwrap();
        assert_eq!(persistence.load_rules().await.unwrap(), Some(rules));
    }

    #[tokio::test]
    async fn metrics_summary_is_stored_as_json() {
        let persistence = Persistence::new(Some(Arc::new(MemoryStore::new(16))));
        persistence
            .save_metrics(&serde_json::json!({ "events": { "processed": 3 } }))
            .await
            .unwrap();
        let stored = persistence.load_metrics().await.unwrap().unwrap();
        assert_eq!(stored["events"]["processed"], 3);
    }

    #[tokio::test]
    async fn missing_store_is_a_noop() {
        let persistence = Persistence::new(None);
        assert!(!persistence.is_enabled());
        persistence.save_rules(&default_rules(&["log".to_string()])).await.unwrap();
        assert_eq!(persistence.load_rules().await.unwrap(), None);
    }
}
