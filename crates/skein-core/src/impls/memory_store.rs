//! In-memory versioned store.
//!
//! 開発・テスト用。version はストア全体で単調増加させる
//! （delete → 再作成で同じ version が再利用される ABA を避けるため）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::error::{EngineError, Result};
use crate::ports::{Versioned, VersionedStore};

fn poison_err<T>(_: PoisonError<T>) -> EngineError {
    EngineError::storage("in-memory store lock poisoned")
}

pub struct InMemoryVersionedStore<V> {
    entries: RwLock<HashMap<String, Versioned<V>>>,
    next_version: AtomicU64,
}

impl<V> InMemoryVersionedStore<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
        }
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for InMemoryVersionedStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> VersionedStore<V> for InMemoryVersionedStore<V> {
    fn get(&self, key: &str) -> Result<Option<Versioned<V>>> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries.get(key).cloned())
    }

    fn cas_replace(&self, key: &str, value: V, expected_version: u64) -> Result<bool> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        match entries.get_mut(key) {
            Some(current) if current.version == expected_version => {
                *current = Versioned::new(value, self.bump());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn cas_create(&self, key: &str, value: V) -> Result<Option<Versioned<V>>> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        if let Some(existing) = entries.get(key) {
            return Ok(Some(existing.clone()));
        }
        entries.insert(key.to_string(), Versioned::new(value, self.bump()));
        Ok(None)
    }

    fn cas_delete(&self, key: &str, expected_version: u64) -> Result<bool> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        match entries.get(key) {
            Some(current) if current.version == expected_version => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn scan(&self, filter: &dyn Fn(&V) -> bool) -> Result<Vec<(String, Versioned<V>)>> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries
            .iter()
            .filter(|(_, v)| filter(&v.value))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
