//! Store - 3 つの versioned map とトランザクション
//!
//! `Storage` bundles the task, counter and constraint maps behind the
//! [`VersionedStore`] port. All engine mutation goes through a
//! [`Transaction`], which stages CAS writes and commits them atomically.

mod transaction;

use std::sync::{Arc, Mutex};

pub use transaction::Transaction;

use crate::domain::Task;
use crate::impls::InMemoryVersionedStore;
use crate::ports::VersionedStore;

pub struct Storage {
    pub(crate) tasks: Arc<dyn VersionedStore<Task>>,
    pub(crate) counters: Arc<dyn VersionedStore<i64>>,
    pub(crate) constraints: Arc<dyn VersionedStore<String>>,
    /// Serializes commit validation + apply.
    commit_lock: Mutex<()>,
}

impl Storage {
    pub fn new(
        tasks: Arc<dyn VersionedStore<Task>>,
        counters: Arc<dyn VersionedStore<i64>>,
        constraints: Arc<dyn VersionedStore<String>>,
    ) -> Self {
        Self {
            tasks,
            counters,
            constraints,
            commit_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryVersionedStore::new()),
            Arc::new(InMemoryVersionedStore::new()),
            Arc::new(InMemoryVersionedStore::new()),
        )
    }

    /// Committed view of one task, outside any transaction.
    pub fn task(&self, name: &str) -> crate::error::Result<Option<Task>> {
        Ok(self.tasks.get(name)?.map(|v| v.value))
    }
}
