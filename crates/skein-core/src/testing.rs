//! Test fakes shared by the unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::config::{EngineConfig, RetryConfig};
use crate::domain::{Callback, CreateGraphRequest, CreateTask, State, Task, Transition};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::impls::InMemoryResourceHolder;
use crate::jobs::{Job, TransactionPhase};
use crate::ports::{FixedClock, Notifier, RemoteError, RemoteWorker, UlidGenerator};
use crate::store::{Storage, Transaction};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ========================================
// jobs
// ========================================

/// In-progress job counting its runs, optionally failing the first ones.
pub struct CountingJob {
    name: &'static str,
    failures: usize,
    error: fn() -> EngineError,
    runs: AtomicUsize,
    transactional_runs: AtomicUsize,
}

impl std::fmt::Debug for CountingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingJob").field("name", &self.name).finish()
    }
}

impl CountingJob {
    pub fn ok(name: &'static str) -> Arc<Self> {
        Self::failing_with(name, 0, || EngineError::Internal("unused".into()))
    }

    pub fn failing(name: &'static str) -> Arc<Self> {
        Self::failing_with(name, usize::MAX, || EngineError::Internal("job failed".into()))
    }

    /// Fails the first `failures` runs with `error()`.
    pub fn failing_with(name: &'static str, failures: usize, error: fn() -> EngineError) -> Arc<Self> {
        Arc::new(Self {
            name,
            failures,
            error,
            runs: AtomicUsize::new(0),
            transactional_runs: AtomicUsize::new(0),
        })
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn transactional_runs(&self) -> usize {
        self.transactional_runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Job for CountingJob {
    fn phase(&self) -> TransactionPhase {
        TransactionPhase::InProgress
    }

    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, _engine: &Engine, tx: Option<&mut Transaction>) -> Result<()> {
        let previous = self.runs.fetch_add(1, Ordering::SeqCst);
        if tx.is_some() {
            self.transactional_runs.fetch_add(1, Ordering::SeqCst);
        }
        if previous < self.failures {
            return Err((self.error)());
        }
        Ok(())
    }
}

// ========================================
// collaborators
// ========================================

/// Remote worker that records every call. Calls scripted with `fail_on`
/// return a transport error.
#[derive(Default)]
pub struct RecordingWorker {
    calls: Mutex<Vec<(&'static str, String)>>,
    failing: Mutex<HashSet<(&'static str, String)>>,
}

impl RecordingWorker {
    /// `call` is one of `"start"`, `"stop"`, `"rollback"`.
    pub fn fail_on(&self, call: &'static str, task: &str) {
        lock(&self.failing).insert((call, task.to_string()));
    }

    /// Tasks `call` was made for, in call order.
    pub fn calls_to(&self, call: &str) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|(c, _)| *c == call)
            .map(|(_, task)| task.clone())
            .collect()
    }

    fn record(&self, call: &'static str, task: &Task) -> std::result::Result<(), RemoteError> {
        lock(&self.calls).push((call, task.name.clone()));
        if lock(&self.failing).contains(&(call, task.name.clone())) {
            return Err(RemoteError::Transport(format!("{call} {} refused", task.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteWorker for RecordingWorker {
    async fn start(&self, task: &Task) -> std::result::Result<(), RemoteError> {
        self.record("start", task)
    }

    async fn stop(&self, task: &Task) -> std::result::Result<(), RemoteError> {
        self.record("stop", task)
    }

    async fn rollback(&self, task: &Task) -> std::result::Result<(), RemoteError> {
        self.record("rollback", task)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Transition, String)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    /// Every notification about `task` fails from now on.
    pub fn fail_for(&self, task: &str) {
        lock(&self.failing).insert(task.to_string());
    }

    pub fn sent_for(&self, task: &str) -> Vec<Transition> {
        lock(&self.sent)
            .iter()
            .filter(|(_, name)| name == task)
            .map(|(transition, _)| *transition)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, transition: Transition, task: &Task) -> std::result::Result<(), RemoteError> {
        lock(&self.sent).push((transition, task.name.clone()));
        if lock(&self.failing).contains(&task.name) {
            return Err(RemoteError::Rejected(format!("caller rejected {transition}")));
        }
        Ok(())
    }
}

/// Handles on the fakes wired into a [`test_engine`].
pub struct Rig {
    pub worker: Arc<RecordingWorker>,
    pub notifier: Arc<RecordingNotifier>,
    pub holder: Arc<InMemoryResourceHolder>,
    pub clock: Arc<FixedClock>,
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        node_id: "test-node".into(),
        tx_retry: RetryConfig {
            max_attempts: 10,
            base_delay_ms: 1,
            multiplier: 1.0,
        },
        ..EngineConfig::default()
    }
}

pub fn test_engine() -> (Engine, Rig) {
    test_engine_with(test_config())
}

pub fn test_engine_with(config: EngineConfig) -> (Engine, Rig) {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default();
    let rig = Rig {
        worker: Arc::new(RecordingWorker::default()),
        notifier: Arc::new(RecordingNotifier::default()),
        holder: Arc::new(InMemoryResourceHolder::new()),
        clock: Arc::new(FixedClock::new(start)),
    };
    let engine = Engine::new(
        config,
        Arc::new(Storage::in_memory()),
        rig.worker.clone(),
        rig.notifier.clone(),
        rig.holder.clone(),
        rig.clock.clone(),
        Arc::new(UlidGenerator::new(rig.clock.clone())),
    );
    (engine, rig)
}

// ========================================
// batches and driving
// ========================================

/// Active tasks where each one depends on the one before it.
pub fn linear(names: &[&str]) -> CreateGraphRequest {
    let mut batch = CreateGraphRequest::new();
    for name in names {
        batch = batch.task(CreateTask::new(*name).active());
    }
    for pair in names.windows(2) {
        batch = batch.edge(pair[1], pair[0]);
    }
    batch
}

pub fn state_of(engine: &Engine, name: &str) -> State {
    engine
        .task(name)
        .unwrap()
        .unwrap_or_else(|| panic!("task {name} is gone"))
        .state
}

/// Answer the worker call `name` is waiting for, positively, then let
/// the cascade settle.
pub async fn succeed(engine: &Engine, name: &str) {
    let task = engine.task(name).unwrap().unwrap();
    let callback = match task.state {
        State::Rollingback | State::RollbackRequested => Callback::rollback(task.epoch()),
        _ => Callback::new(task.epoch()),
    };
    engine.accept(name, callback).await.unwrap();
    engine.wait_idle().await;
}

pub async fn fail(engine: &Engine, name: &str) {
    let task = engine.task(name).unwrap().unwrap();
    let callback = match task.state {
        State::Rollingback | State::RollbackRequested => Callback::rollback(task.epoch()),
        _ => Callback::new(task.epoch()),
    };
    engine.fail(name, callback).await.unwrap();
    engine.wait_idle().await;
}
