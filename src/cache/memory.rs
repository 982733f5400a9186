//! In-memory cache backend for single-process operation and tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{CacheBackend, CacheError};

#[derive(Debug, Clone)]
struct StoredEntry {
    data: Vec<u8>,
    /// `None` means the entry never expires.
    expires_at: Option<Instant>,
}

/// In-memory cache store. Entries are dropped lazily on access.
#[derive(Clone, Default)]
pub struct MemoryCacheBackend {
    entries: Arc<RwLock<HashMap<String, StoredEntry>>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|e| e.expires_at.map_or(true, |at| at > now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn connect(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn get(&self, fingerprint: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let entries = self.entries.read().await;
        match entries.get(fingerprint) {
            Some(entry) if entry.expires_at.map_or(true, |at| at > Instant::now()) => {
                Ok(Some(entry.data.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn put(
        &self,
        fingerprint: &str,
        entry: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at.map_or(true, |at| at > now));
        entries.insert(
            fingerprint.to_string(),
            StoredEntry {
                data: entry,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }
}
