//! VersionedStore port - version 付き KV ストアの抽象化
//!
//! すべての更新は read-version → mutate → CAS-write。
//! ストア自身はロックを貸し出さない（楽観的並行制御）。
//!
//! # 実装
//! - **InMemoryVersionedStore**: 単一プロセス用（impls/memory_store.rs）

use crate::error::Result;

/// A value together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<V> {
    pub value: V,
    pub version: u64,
}

impl<V> Versioned<V> {
    pub fn new(value: V, version: u64) -> Self {
        Self { value, version }
    }
}

/// Per-entity-type versioned map (tasks, counters, constraints).
///
/// # Contract
/// - versions are monotonic per key and change on every write
/// - `cas_create` returns the existing entry on collision and writes nothing
/// - `cas_replace` / `cas_delete` return `false` on version mismatch or when
///   the key is absent
pub trait VersionedStore<V>: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Versioned<V>>>;

    fn cas_replace(&self, key: &str, value: V, expected_version: u64) -> Result<bool>;

    fn cas_create(&self, key: &str, value: V) -> Result<Option<Versioned<V>>>;

    fn cas_delete(&self, key: &str, expected_version: u64) -> Result<bool>;

    /// Filtered enumeration. Order is unspecified.
    fn scan(&self, filter: &dyn Fn(&V) -> bool) -> Result<Vec<(String, Versioned<V>)>>;
}
