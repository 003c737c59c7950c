//! Transaction - CAS 書き込みのステージングと一括コミット
//!
//! # Design note
//! Every key a transaction touches is read once from the store and its
//! version remembered. Writes only change the staged copy; CAS checks inside
//! the transaction run against that staged copy. `commit` re-validates every
//! touched key against the store under a single lock and then applies all
//! writes, so a transaction lands completely or not at all.
//!
//! Deferred after-commit jobs ride on the transaction and are handed back by
//! `commit` for dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use super::Storage;
use crate::domain::{State, Task, TransactionId};
use crate::error::{EngineError, Result};
use crate::jobs::Job;
use crate::ports::{Versioned, VersionedStore};

/// One touched key.
struct Entry<V> {
    /// What the store held when the key was first touched.
    base: Option<Versioned<V>>,
    /// Staged value; `None` means absent (never existed or deleted).
    current: Option<V>,
    /// Version handed to callers for in-transaction CAS.
    view_version: u64,
    dirty: bool,
}

struct Staging<V> {
    entries: HashMap<String, Entry<V>>,
}

impl<V: Clone> Staging<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn touch(&mut self, store: &dyn VersionedStore<V>, key: &str) -> Result<&mut Entry<V>> {
        if !self.entries.contains_key(key) {
            let base = store.get(key)?;
            let entry = Entry {
                current: base.as_ref().map(|b| b.value.clone()),
                view_version: base.as_ref().map_or(0, |b| b.version),
                base,
                dirty: false,
            };
            self.entries.insert(key.to_string(), entry);
        }
        self.entries
            .get_mut(key)
            .ok_or_else(|| EngineError::Internal(format!("staging lost key {key}")))
    }

    fn get(&mut self, store: &dyn VersionedStore<V>, key: &str) -> Result<Option<Versioned<V>>> {
        let entry = self.touch(store, key)?;
        Ok(entry
            .current
            .as_ref()
            .map(|v| Versioned::new(v.clone(), entry.view_version)))
    }

    fn cas_replace(
        &mut self,
        store: &dyn VersionedStore<V>,
        key: &str,
        value: V,
        expected: u64,
    ) -> Result<bool> {
        let entry = self.touch(store, key)?;
        if entry.current.is_none() || entry.view_version != expected {
            return Ok(false);
        }
        entry.current = Some(value);
        entry.view_version += 1;
        entry.dirty = true;
        Ok(true)
    }

    fn cas_create(
        &mut self,
        store: &dyn VersionedStore<V>,
        key: &str,
        value: V,
    ) -> Result<Option<Versioned<V>>> {
        let entry = self.touch(store, key)?;
        if let Some(existing) = &entry.current {
            return Ok(Some(Versioned::new(existing.clone(), entry.view_version)));
        }
        entry.current = Some(value);
        entry.view_version += 1;
        entry.dirty = true;
        Ok(None)
    }

    fn cas_delete(&mut self, store: &dyn VersionedStore<V>, key: &str, expected: u64) -> Result<bool> {
        let entry = self.touch(store, key)?;
        if entry.current.is_none() || entry.view_version != expected {
            return Ok(false);
        }
        entry.current = None;
        entry.view_version += 1;
        entry.dirty = true;
        Ok(true)
    }

    /// Committed entries overlaid with staged ones.
    fn scan(
        &self,
        store: &dyn VersionedStore<V>,
        filter: &dyn Fn(&V) -> bool,
    ) -> Result<Vec<(String, Versioned<V>)>> {
        let mut out: Vec<(String, Versioned<V>)> = store
            .scan(filter)?
            .into_iter()
            .filter(|(k, _)| !self.entries.contains_key(k))
            .collect();
        for (key, entry) in &self.entries {
            if let Some(v) = &entry.current
                && filter(v)
            {
                out.push((key.clone(), Versioned::new(v.clone(), entry.view_version)));
            }
        }
        Ok(out)
    }

    fn validate(&self, store: &dyn VersionedStore<V>) -> Result<()> {
        for (key, entry) in &self.entries {
            let now = store.get(key)?.map(|v| v.version);
            let then = entry.base.as_ref().map(|b| b.version);
            if now != then {
                return Err(EngineError::concurrent(key.clone()));
            }
        }
        Ok(())
    }

    fn apply(self, store: &dyn VersionedStore<V>) -> Result<()> {
        for (key, entry) in self.entries {
            if !entry.dirty {
                continue;
            }
            let applied = match (entry.base, entry.current) {
                (Some(base), Some(value)) => store.cas_replace(&key, value, base.version)?,
                (None, Some(value)) => store.cas_create(&key, value)?.is_none(),
                (Some(base), None) => store.cas_delete(&key, base.version)?,
                (None, None) => true,
            };
            if !applied {
                return Err(EngineError::concurrent(key));
            }
        }
        Ok(())
    }
}

/// A unit of work against [`Storage`].
pub struct Transaction {
    id: TransactionId,
    storage: Arc<Storage>,
    tasks: Staging<Task>,
    counters: Staging<i64>,
    constraints: Staging<String>,
    deferred: Vec<Arc<dyn Job>>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, storage: Arc<Storage>) -> Self {
        Self {
            id,
            storage,
            tasks: Staging::new(),
            counters: Staging::new(),
            constraints: Staging::new(),
            deferred: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    // ========================================
    // tasks
    // ========================================

    pub fn get_task(&mut self, name: &str) -> Result<Option<Versioned<Task>>> {
        self.tasks.get(self.storage.tasks.as_ref(), name)
    }

    /// Like `get_task` but absence is an error.
    pub fn load_task(&mut self, name: &str) -> Result<Versioned<Task>> {
        self.get_task(name)?
            .ok_or_else(|| EngineError::not_found(name))
    }

    /// Pull a task into the transaction so commit validates it, without
    /// caring about its value.
    pub fn pull_task(&mut self, name: &str) -> Result<()> {
        self.tasks.touch(self.storage.tasks.as_ref(), name).map(|_| ())
    }

    pub fn cas_replace_task(&mut self, task: Task, expected: u64) -> Result<bool> {
        let name = task.name.clone();
        self.tasks
            .cas_replace(self.storage.tasks.as_ref(), &name, task, expected)
    }

    pub fn cas_create_task(&mut self, task: Task) -> Result<Option<Versioned<Task>>> {
        let name = task.name.clone();
        self.tasks.cas_create(self.storage.tasks.as_ref(), &name, task)
    }

    pub fn cas_delete_task(&mut self, name: &str, expected: u64) -> Result<bool> {
        self.tasks.cas_delete(self.storage.tasks.as_ref(), name, expected)
    }

    pub fn scan_tasks(&self, filter: &dyn Fn(&Task) -> bool) -> Result<Vec<Versioned<Task>>> {
        Ok(self
            .tasks
            .scan(self.storage.tasks.as_ref(), filter)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    pub fn tasks_in_states(&self, states: &[State]) -> Result<Vec<Versioned<Task>>> {
        self.scan_tasks(&|t| states.contains(&t.state))
    }

    /// ENQUEUED tasks of one queue (`None` = default queue).
    pub fn enqueued_in(&self, queue: Option<&str>) -> Result<Vec<Versioned<Task>>> {
        self.scan_tasks(&|t| t.state == State::Enqueued && t.queue() == queue)
    }

    pub fn disposable_without_dependants(&self) -> Result<Vec<Versioned<Task>>> {
        self.scan_tasks(&|t| t.disposable && t.dependants.is_empty())
    }

    // ========================================
    // counters
    // ========================================

    pub fn get_counter(&mut self, key: &str) -> Result<Option<Versioned<i64>>> {
        self.counters.get(self.storage.counters.as_ref(), key)
    }

    pub fn cas_replace_counter(&mut self, key: &str, value: i64, expected: u64) -> Result<bool> {
        self.counters
            .cas_replace(self.storage.counters.as_ref(), key, value, expected)
    }

    pub fn cas_create_counter(&mut self, key: &str, value: i64) -> Result<Option<Versioned<i64>>> {
        self.counters
            .cas_create(self.storage.counters.as_ref(), key, value)
    }

    // ========================================
    // constraints
    // ========================================

    pub fn get_constraint(&mut self, constraint: &str) -> Result<Option<Versioned<String>>> {
        self.constraints
            .get(self.storage.constraints.as_ref(), constraint)
    }

    pub fn cas_create_constraint(
        &mut self,
        constraint: &str,
        holder: &str,
    ) -> Result<Option<Versioned<String>>> {
        self.constraints.cas_create(
            self.storage.constraints.as_ref(),
            constraint,
            holder.to_string(),
        )
    }

    pub fn cas_delete_constraint(&mut self, constraint: &str, expected: u64) -> Result<bool> {
        self.constraints
            .cas_delete(self.storage.constraints.as_ref(), constraint, expected)
    }

    // ========================================
    // deferred jobs / commit
    // ========================================

    /// Queue a job to run once this transaction has committed.
    pub(crate) fn defer(&mut self, job: Arc<dyn Job>) {
        self.deferred.push(job);
    }

    /// Validate and apply every staged write. On success the deferred jobs
    /// are handed back; on failure nothing was written and they are dropped.
    pub(crate) fn commit(self) -> Result<Vec<Arc<dyn Job>>> {
        let storage = Arc::clone(&self.storage);
        let _guard = storage
            .commit_lock
            .lock()
            .map_err(|_| EngineError::storage("commit lock poisoned"))?;

        self.tasks.validate(storage.tasks.as_ref())?;
        self.counters.validate(storage.counters.as_ref())?;
        self.constraints.validate(storage.constraints.as_ref())?;

        self.tasks.apply(storage.tasks.as_ref())?;
        self.counters.apply(storage.counters.as_ref())?;
        self.constraints.apply(storage.constraints.as_ref())?;

        Ok(self.deferred)
    }
}
