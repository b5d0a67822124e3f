use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;
use crate::error::{Result, WorkbenchError};

/// Key-value store with per-entry expiry. Expired entries behave exactly like
/// absent ones for every read.
#[async_trait]
pub trait Cache<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// A `ttl_seconds` of zero stores the value without expiry.
    async fn set(&self, key: &str, value: V, ttl_seconds: u64) -> Result<()>;
    async fn set_until(&self, key: &str, value: V, deadline: DateTime<Utc>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<V>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn get_and_delete(&self, key: &str) -> Result<V>;
    async fn clear(&self) -> Result<()>;
    async fn purge_expired(&self) -> Result<usize>;
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Option<DateTime<Utc>>,
}

impl<V> Entry<V> {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

pub struct MemoryCache<V> {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V> MemoryCache<V> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn miss(key: &str) -> WorkbenchError {
        WorkbenchError::Miss(key.to_string())
    }
}

#[async_trait]
impl<V> Cache<V> for MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn set(&self, key: &str, value: V, ttl_seconds: u64) -> Result<()> {
        let expires_at = if ttl_seconds == 0 {
            None
        } else {
            let ttl = i64::try_from(ttl_seconds).unwrap_or(i64::MAX / 1_000);
            Some(self.clock.now() + Duration::seconds(ttl))
        };
        let mut entries = self.entries.lock().map_err(WorkbenchError::poisoned)?;
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn set_until(&self, key: &str, value: V, deadline: DateTime<Utc>) -> Result<()> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().map_err(WorkbenchError::poisoned)?;
        if deadline <= now {
            entries.remove(key);
        } else {
            entries.insert(
                key.to_string(),
                Entry {
                    value,
                    expires_at: Some(deadline),
                },
            );
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<V> {
        let now = self.clock.now();
        let entries = self.entries.lock().map_err(WorkbenchError::poisoned)?;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(entry.value.clone()),
            _ => Err(Self::miss(key)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let entries = self.entries.lock().map_err(WorkbenchError::poisoned)?;
        Ok(entries.get(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().map_err(WorkbenchError::poisoned)?;
        match entries.remove(key) {
            Some(entry) if entry.is_live(now) => Ok(()),
            _ => Err(Self::miss(key)),
        }
    }

    async fn get_and_delete(&self, key: &str) -> Result<V> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().map_err(WorkbenchError::poisoned)?;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => {}
            Some(_) => {
                entries.remove(key);
                return Err(Self::miss(key));
            }
            None => return Err(Self::miss(key)),
        }
        entries
            .remove(key)
            .map(|entry| entry.value)
            .ok_or_else(|| Self::miss(key))
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().map_err(WorkbenchError::poisoned)?.clear();
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().map_err(WorkbenchError::poisoned)?;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(before - entries.len())
    }
}
