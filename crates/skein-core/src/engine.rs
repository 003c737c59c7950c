//! Engine - ワイヤリングとジョブ実行
//!
//! `Engine` owns the collaborators and the storage, hands out the
//! controller views (`controller()`, `queue()`, `rollback()`, `graph()`),
//! and runs jobs:
//!
//! - in-progress jobs run immediately inside the caller's transaction
//! - after-commit jobs are deferred on the transaction and run once it
//!   committed: synchronous ones inline, async ones on tokio behind a
//!   semaphore of `job_workers` permits
//!
//! The facade methods (`submit`, `accept`, ...) each run one controller
//! operation in a fresh transaction and retry lost CAS races per
//! `tx_retry`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Notify, Semaphore};

use crate::config::EngineConfig;
use crate::controller::Controller;
use crate::domain::{Callback, CreateGraphRequest, Mode, State, Task};
use crate::error::{ErrorKind, Result};
use crate::graph::{GraphContainer, TaskGraph};
use crate::jobs::{Job, RetryPolicy, TransactionPhase};
use crate::ports::{Clock, IdGenerator, Notifier, RemoteWorker, ResourceHolder};
use crate::queue::QueueController;
use crate::rollback::RollbackPlanner;
use crate::store::{Storage, Transaction};

/// Future returned by the closures given to [`Engine::transact`].
pub type TxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

struct EngineInner {
    config: EngineConfig,
    storage: Arc<Storage>,
    remote: Arc<dyn RemoteWorker>,
    notifier: Arc<dyn Notifier>,
    holder: Arc<dyn ResourceHolder>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    tx_retry: RetryPolicy,
    workers: Arc<Semaphore>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("node_id", &self.inner.config.node_id)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Engine {
    pub(crate) fn new(
        config: EngineConfig,
        storage: Arc<Storage>,
        remote: Arc<dyn RemoteWorker>,
        notifier: Arc<dyn Notifier>,
        holder: Arc<dyn ResourceHolder>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let tx_retry = RetryPolicy::from(&config.tx_retry);
        let workers = Arc::new(Semaphore::new(config.job_workers));
        Self {
            inner: Arc::new(EngineInner {
                config,
                storage,
                remote,
                notifier,
                holder,
                clock,
                ids,
                tx_retry,
                workers,
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    // ========================================
    // collaborators
    // ========================================

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.inner.storage
    }

    pub fn remote(&self) -> &Arc<dyn RemoteWorker> {
        &self.inner.remote
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.inner.notifier
    }

    pub fn resource_holder(&self) -> &Arc<dyn ResourceHolder> {
        &self.inner.holder
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn ids(&self) -> &Arc<dyn IdGenerator> {
        &self.inner.ids
    }

    pub fn tx_retry(&self) -> RetryPolicy {
        self.inner.tx_retry.clone()
    }

    // ========================================
    // views
    // ========================================

    pub fn controller(&self) -> Controller<'_> {
        Controller::new(self)
    }

    pub fn queue(&self) -> QueueController<'_> {
        QueueController::new(self)
    }

    pub fn rollback(&self) -> RollbackPlanner<'_> {
        RollbackPlanner::new(self)
    }

    pub fn graph(&self) -> GraphContainer<'_> {
        GraphContainer::new(self)
    }

    // ========================================
    // transactions and jobs
    // ========================================

    pub fn begin(&self) -> Transaction {
        Transaction::new(self.inner.ids.transaction_id(), Arc::clone(&self.inner.storage))
    }

    /// Commit `tx`, then run what it deferred.
    ///
    /// A failing synchronous after-commit job does not fail the commit: the
    /// writes are already in place. It is logged and the next job runs.
    pub async fn commit(&self, tx: Transaction) -> Result<()> {
        let id = tx.id();
        let jobs = tx.commit()?;
        tracing::trace!(tx = %id, deferred = jobs.len(), "committed");

        for job in jobs {
            if job.is_async() {
                self.spawn(job);
            } else if let Err(e) = job.run(self, None).await {
                tracing::warn!(job = job.name(), task = job.task(), error = %e, "after-commit job failed");
            }
        }
        Ok(())
    }

    /// Run `job` now if it belongs to the transaction, otherwise defer it
    /// until `tx` commits.
    pub(crate) async fn dispatch(&self, tx: &mut Transaction, job: Arc<dyn Job>) -> Result<()> {
        match job.phase() {
            TransactionPhase::InProgress => {
                tracing::debug!(job = job.name(), task = job.task(), "running job");
                job.run(self, Some(tx)).await
            }
            TransactionPhase::AfterSuccess => {
                tracing::debug!(job = job.name(), task = job.task(), asynchronous = job.is_async(), "deferring job");
                tx.defer(job);
                Ok(())
            }
        }
    }

    /// One attempt: fresh transaction, run, commit.
    pub async fn run_in_new_transaction(&self, job: &dyn Job) -> Result<()> {
        let mut tx = self.begin();
        job.run(self, Some(&mut tx)).await?;
        self.commit(tx).await
    }

    fn spawn(&self, job: Arc<dyn Job>) {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let engine = self.clone();
        tokio::spawn(async move {
            match Arc::clone(&engine.inner.workers).acquire_owned().await {
                Ok(_permit) => {
                    if let Err(e) = job.run(&engine, None).await {
                        tracing::error!(job = job.name(), task = job.task(), error = %e, "async job failed");
                    }
                }
                Err(_) => {
                    tracing::error!(job = job.name(), task = job.task(), "worker pool closed, job dropped");
                }
            }
            if engine.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                engine.inner.idle.notify_waiters();
            }
        });
    }

    /// Async jobs spawned and not finished yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no async job is in flight.
    ///
    /// Jobs spawn follow-up jobs, so "idle" is only observed once the whole
    /// cascade has drained. A remote worker that answers later through
    /// `accept`/`fail` starts a new cascade.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // register before checking, or a wake-up between the two is lost
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Run `operation` in a fresh transaction and commit, starting over
    /// when the commit (or the operation) lost a CAS race.
    pub async fn transact<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send,
        F: for<'a> Fn(&'a Engine, &'a mut Transaction) -> TxFuture<'a, T> + Send + Sync,
    {
        let policy = self.tx_retry();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut tx = self.begin();
            let outcome = match f(self, &mut tx).await {
                Ok(value) => self.commit(tx).await.map(|()| value),
                Err(e) => Err(e),
            };
            match outcome {
                Err(e) if e.is_retryable() && policy.allows(attempts) => {
                    let delay = policy.next_delay(attempts);
                    tracing::debug!(operation, attempts, ?delay, error = %e, "retrying operation");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    // ========================================
    // facade
    // ========================================

    /// Install a batch of tasks and edges; returns the installed names.
    #[tracing::instrument(level = "debug", skip(self, batch), fields(tasks = batch.vertices.len(), edges = batch.edges.len()))]
    pub async fn submit(&self, batch: CreateGraphRequest) -> Result<Vec<String>> {
        self.transact("submit", |engine, tx| {
            let batch = batch.clone();
            Box::pin(async move { engine.graph().install(tx, batch).await })
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_mode(&self, name: &str, mode: Mode) -> Result<()> {
        self.transact("set_mode", |engine, tx| {
            let name = name.to_string();
            Box::pin(async move { engine.controller().set_mode(tx, &name, mode).await })
        })
        .await
    }

    pub async fn cancel(&self, name: &str) -> Result<()> {
        self.set_mode(name, Mode::Cancel).await
    }

    /// Positive callback from the remote worker.
    #[tracing::instrument(level = "debug", skip(self, callback), fields(epoch = callback.epoch))]
    pub async fn accept(&self, name: &str, callback: Callback) -> Result<()> {
        self.transact("accept", |engine, tx| {
            let name = name.to_string();
            let callback = callback.clone();
            Box::pin(async move { engine.controller().accept(tx, &name, callback).await })
        })
        .await
    }

    /// Negative callback from the remote worker.
    #[tracing::instrument(level = "debug", skip(self, callback), fields(epoch = callback.epoch))]
    pub async fn fail(&self, name: &str, callback: Callback) -> Result<()> {
        self.transact("fail", |engine, tx| {
            let name = name.to_string();
            let callback = callback.clone();
            Box::pin(async move { engine.controller().fail(tx, &name, callback).await })
        })
        .await
    }

    /// Returns how many tasks the resulting poke promoted.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_max_concurrency(&self, queue: Option<&str>, max: i64) -> Result<usize> {
        self.transact("set_max_concurrency", |engine, tx| {
            let queue = queue.map(str::to_string);
            Box::pin(async move {
                engine
                    .queue()
                    .set_maximum_concurrency(tx, queue.as_deref(), max)
                    .await
            })
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn rollback_from_milestone(&self, milestone: &str) -> Result<Vec<String>> {
        self.transact("rollback_from_milestone", |engine, tx| {
            let milestone = milestone.to_string();
            Box::pin(async move { engine.rollback().rollback_from_milestone(tx, &milestone).await })
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.transact("delete", |engine, tx| {
            let name = name.to_string();
            Box::pin(async move { engine.controller().delete(tx, &name).await })
        })
        .await
    }

    /// Delete every disposable task nothing depends on anymore. Deleting one
    /// may free its dependencies, which then go in the same cascade.
    ///
    /// Returns how many sweep deletions went through.
    pub async fn clean_disposable(&self) -> Result<usize> {
        let names: Vec<String> = self
            .begin()
            .disposable_without_dependants()?
            .into_iter()
            .map(|v| v.value.name)
            .collect();

        let mut deleted = 0;
        for name in names {
            match self.delete(&name).await {
                Ok(()) => deleted += 1,
                // already gone through a cascade, or picked up a dependant
                Err(e) if e.kind() == ErrorKind::IllegalState => {
                    tracing::debug!(task = %name, error = %e, "skipped by sweep");
                }
                Err(e) => return Err(e),
            }
        }
        if deleted > 0 {
            tracing::info!(deleted, "disposable tasks cleaned");
        }
        Ok(deleted)
    }

    // ========================================
    // reads
    // ========================================

    pub fn task(&self, name: &str) -> Result<Option<Task>> {
        self.inner.storage.task(name)
    }

    pub fn tasks_in(&self, states: &[State]) -> Result<Vec<Task>> {
        Ok(self
            .begin()
            .tasks_in_states(states)?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    /// Everything connected to `names`, in either direction.
    pub fn graph_of(&self, names: &[&str]) -> Result<TaskGraph> {
        let mut tx = self.begin();
        self.graph().task_graph(&mut tx, names)
    }

    /// `(max, running)` of a queue.
    pub fn counters(&self, queue: Option<&str>) -> Result<(i64, i64)> {
        let mut tx = self.begin();
        self.queue().counters(&mut tx, queue)
    }
}
