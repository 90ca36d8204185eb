//! In-memory idempotency cache: TTL-bounded, capacity-capped with
//! oldest-entry eviction.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

const DEFAULT_TTL: Duration = Duration::from_secs(900);
const DEFAULT_MAX_ENTRIES: usize = 1000;

pub struct IdempotencyCache {
    ttl: Duration,
    max_entries: usize,
    store: Mutex<HashMap<String, (Instant, Value)>>,
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl IdempotencyCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            store: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a key; expired entries are swept on read.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        match store.get(key) {
            Some((inserted, value)) => {
                if inserted.elapsed() > self.ttl {
                    store.remove(key);
                    None
                } else {
                    Some(value.clone())
                }
            }
            None => None,
        }
    }

    /// Store a value, evicting the oldest entry (by insertion time) at
    /// capacity.
    pub fn store(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        if !store.contains_key(&key) && store.len() >= self.max_entries {
            if let Some(oldest) = store
                .iter()
                .min_by_key(|(_, (inserted, _))| *inserted)
                .map(|(k, _)| k.clone())
            {
                store.remove(&oldest);
            }
        }
        store.insert(key, (Instant::now(), value));
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let before = store.len();
        store.retain(|_, (inserted, _)| inserted.elapsed() <= self.ttl);
        before - store.len()
    }

    pub fn len(&self) -> usize {
        self.store.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
