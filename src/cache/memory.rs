//! In-memory reference backend.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use super::{CacheBackend, CacheEntryMeta};
use crate::error::Result;

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Value,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn size(&self) -> u64 {
        serde_json::to_vec(&self.value)
            .map(|b| b.len() as u64)
            .unwrap_or(0)
    }
}

/// Concurrent map with lazy expiry: expired entries read as absent and
/// are dropped on access.
pub struct MemoryCache {
    name: String,
    entries: DashMap<String, StoredEntry>,
    destroyed: AtomicBool,
}

impl MemoryCache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    fn live(&self, key: &str) -> Option<StoredEntry> {
        let now = Utc::now();
        // Clone out so the shard guard is released before any removal.
        let entry = self.entries.get(key).map(|e| e.clone())?;
        if entry.is_expired(now) {
            self.entries.remove(key);
            return None;
        }
        Some(entry)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> Result<()> {
        self.destroyed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.live(key).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: Value, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                created_at: Utc::now(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn unset(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.live(key).map(|e| e.size()))
    }

    async fn list(&self) -> Result<Vec<CacheEntryMeta>> {
        let now = Utc::now();
        let mut metas: Vec<CacheEntryMeta> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| CacheEntryMeta {
                id: entry.key().clone(),
                created_at: entry.created_at,
                expires_at: entry.expires_at,
                size: entry.size(),
            })
            .collect();
        metas.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(metas)
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        self.entries.clear();
        Ok(())
    }
}
