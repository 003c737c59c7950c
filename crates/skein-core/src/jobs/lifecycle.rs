//! Lifecycle jobs - 遷移ごとに発火する具体的な副作用
//!
//! Each job here is small and talks to exactly one collaborator: the remote
//! worker, the caller notifier, the controller of another task, the queue or
//! the rollback planner. Which jobs a transition fires is decided in
//! `controller::effects`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{Delegate, Job, TransactionPhase, require_tx};
use crate::domain::{ClusteredJobReference, ClusteredJobType, State, Task, Transition};
use crate::engine::Engine;
use crate::error::Result;
use crate::store::Transaction;

/// Wrap `job` so it runs in a transaction of its own, retrying lost races.
pub fn in_new_transaction(engine: &Engine, job: Arc<dyn Job>) -> Delegate {
    Delegate::new(job)
        .in_new_transaction()
        .with_retry(engine.tx_retry())
}

/// After-commit queue poke.
pub fn poke(engine: &Engine, queue: Option<String>) -> Arc<dyn Job> {
    in_new_transaction(engine, Arc::new(PokeQueue { queue }))
        .after_commit(false)
        .into_job()
}

// ========================================
// remote calls
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCall {
    Start,
    Stop,
    Rollback,
}

impl RemoteCall {
    /// The request state whose resolution the call's result decides.
    pub fn request_state(self) -> State {
        match self {
            RemoteCall::Start => State::Starting,
            RemoteCall::Stop => State::StopRequested,
            RemoteCall::Rollback => State::RollbackRequested,
        }
    }
}

/// Calls the remote worker and records the invocation result as an
/// engine-origin response.
#[derive(Debug)]
pub struct InvokeRemote {
    pub call: RemoteCall,
    /// Snapshot taken when the request state was entered.
    pub task: Task,
}

#[async_trait]
impl Job for InvokeRemote {
    fn phase(&self) -> TransactionPhase {
        TransactionPhase::AfterSuccess
    }

    fn is_async(&self) -> bool {
        true
    }

    fn task(&self) -> Option<&str> {
        Some(&self.task.name)
    }

    fn name(&self) -> &'static str {
        match self.call {
            RemoteCall::Start => "invoke-start",
            RemoteCall::Stop => "invoke-stop",
            RemoteCall::Rollback => "invoke-rollback",
        }
    }

    async fn run(&self, engine: &Engine, _tx: Option<&mut Transaction>) -> Result<()> {
        let worker = engine.remote();
        let result = match self.call {
            RemoteCall::Start => worker.start(&self.task).await,
            RemoteCall::Stop => worker.stop(&self.task).await,
            RemoteCall::Rollback => worker.rollback(&self.task).await,
        };

        let (positive, body) = match &result {
            Ok(()) => (true, serde_json::Value::Null),
            Err(e) => {
                tracing::warn!(task = %self.task.name, call = ?self.call, error = %e, "remote call failed");
                (false, json!({ "error": e.to_string() }))
            }
        };

        let record = RecordInvocation {
            task: self.task.name.clone(),
            state: self.call.request_state(),
            epoch: self.task.epoch(),
            positive,
            body,
        };
        in_new_transaction(engine, Arc::new(record))
            .run(engine, None)
            .await
    }
}

#[derive(Debug)]
pub struct RecordInvocation {
    pub task: String,
    pub state: State,
    pub epoch: u32,
    pub positive: bool,
    pub body: serde_json::Value,
}

#[async_trait]
impl Job for RecordInvocation {
    fn phase(&self) -> TransactionPhase {
        TransactionPhase::InProgress
    }

    fn task(&self) -> Option<&str> {
        Some(&self.task)
    }

    fn name(&self) -> &'static str {
        "record-invocation"
    }

    async fn run(&self, engine: &Engine, tx: Option<&mut Transaction>) -> Result<()> {
        let tx = require_tx(tx, self)?;
        engine
            .controller()
            .record_invocation(tx, &self.task, self.state, self.epoch, self.positive, self.body.clone())
            .await
    }
}

// ========================================
// caller notification
// ========================================

#[derive(Debug)]
pub struct NotifyCaller {
    pub transition: Transition,
    pub task: Task,
}

#[async_trait]
impl Job for NotifyCaller {
    fn phase(&self) -> TransactionPhase {
        TransactionPhase::AfterSuccess
    }

    fn is_async(&self) -> bool {
        true
    }

    fn task(&self) -> Option<&str> {
        Some(&self.task.name)
    }

    fn name(&self) -> &'static str {
        "notify-caller"
    }

    async fn run(&self, engine: &Engine, _tx: Option<&mut Transaction>) -> Result<()> {
        if self.task.caller_notifications.is_none() {
            return Ok(());
        }
        engine
            .notifier()
            .notify(self.transition, &self.task)
            .await
            .map_err(|e| {
                tracing::warn!(task = %self.task.name, transition = %self.transition, error = %e, "caller notification failed");
                e.into()
            })
    }
}

// ========================================
// neighbour messages
// ========================================

/// What a dependency tells its dependants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependantEvent {
    Succeeded,
    Stopped { cause: String },
    Cancelled { cause: String },
    NotificationFailed,
    Reset,
}

#[derive(Debug)]
pub struct InformDependants {
    pub task: String,
    pub dependants: Vec<String>,
    pub event: DependantEvent,
}

#[async_trait]
impl Job for InformDependants {
    fn phase(&self) -> TransactionPhase {
        TransactionPhase::InProgress
    }

    fn task(&self) -> Option<&str> {
        Some(&self.task)
    }

    fn name(&self) -> &'static str {
        "inform-dependants"
    }

    async fn run(&self, engine: &Engine, tx: Option<&mut Transaction>) -> Result<()> {
        let tx = require_tx(tx, self)?;
        let controller = engine.controller();
        for dependant in &self.dependants {
            match &self.event {
                DependantEvent::Succeeded => {
                    controller.dependency_succeeded(tx, dependant, &self.task).await?
                }
                DependantEvent::Stopped { cause } => {
                    controller
                        .dependency_stopped(tx, dependant, &self.task, cause)
                        .await?
                }
                DependantEvent::Cancelled { cause } => {
                    controller
                        .dependency_cancelled(tx, dependant, &self.task, cause)
                        .await?
                }
                DependantEvent::NotificationFailed => {
                    controller
                        .dependency_notification_failed(tx, dependant, &self.task)
                        .await?
                }
                DependantEvent::Reset => controller.dependency_reset(tx, dependant, &self.task).await?,
            }
        }
        Ok(())
    }
}

/// What a dependant tells its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyEvent {
    RolledBack,
    Deleted,
}

#[derive(Debug)]
pub struct InformDependencies {
    pub task: String,
    pub dependencies: Vec<String>,
    pub event: DependencyEvent,
}

#[async_trait]
impl Job for InformDependencies {
    fn phase(&self) -> TransactionPhase {
        TransactionPhase::InProgress
    }

    fn task(&self) -> Option<&str> {
        Some(&self.task)
    }

    fn name(&self) -> &'static str {
        "inform-dependencies"
    }

    async fn run(&self, engine: &Engine, tx: Option<&mut Transaction>) -> Result<()> {
        let tx = require_tx(tx, self)?;
        let controller = engine.controller();
        for dependency in &self.dependencies {
            match self.event {
                DependencyEvent::RolledBack => {
                    controller
                        .dependant_rolled_back(tx, dependency, &self.task)
                        .await?
                }
                DependencyEvent::Deleted => {
                    controller.dependant_deleted(tx, dependency, &self.task).await?
                }
            }
        }
        Ok(())
    }
}

// ========================================
// housekeeping
// ========================================

#[derive(Debug)]
pub struct MarkForDisposal {
    pub task: String,
}

#[async_trait]
impl Job for MarkForDisposal {
    fn phase(&self) -> TransactionPhase {
        TransactionPhase::InProgress
    }

    fn task(&self) -> Option<&str> {
        Some(&self.task)
    }

    fn name(&self) -> &'static str {
        "mark-for-disposal"
    }

    async fn run(&self, engine: &Engine, tx: Option<&mut Transaction>) -> Result<()> {
        let tx = require_tx(tx, self)?;
        engine.controller().mark_for_disposal(tx, &self.task).await
    }
}

#[derive(Debug)]
pub struct ClearConstraint {
    pub task: String,
}

#[async_trait]
impl Job for ClearConstraint {
    fn phase(&self) -> TransactionPhase {
        TransactionPhase::InProgress
    }

    fn task(&self) -> Option<&str> {
        Some(&self.task)
    }

    fn name(&self) -> &'static str {
        "clear-constraint"
    }

    async fn run(&self, engine: &Engine, tx: Option<&mut Transaction>) -> Result<()> {
        let tx = require_tx(tx, self)?;
        engine.controller().clear_constraint(tx, &self.task).await
    }
}

// ========================================
// queue
// ========================================

#[derive(Debug)]
pub struct DecreaseRunningCounter {
    pub queue: Option<String>,
}

#[async_trait]
impl Job for DecreaseRunningCounter {
    fn phase(&self) -> TransactionPhase {
        TransactionPhase::InProgress
    }

    fn name(&self) -> &'static str {
        "decrease-running-counter"
    }

    async fn run(&self, engine: &Engine, tx: Option<&mut Transaction>) -> Result<()> {
        let tx = require_tx(tx, self)?;
        engine
            .queue()
            .decrease_running_counter(tx, self.queue.as_deref())
            .await
    }
}

#[derive(Debug)]
pub struct PokeQueue {
    pub queue: Option<String>,
}

#[async_trait]
impl Job for PokeQueue {
    fn phase(&self) -> TransactionPhase {
        TransactionPhase::InProgress
    }

    fn name(&self) -> &'static str {
        "poke-queue"
    }

    async fn run(&self, engine: &Engine, tx: Option<&mut Transaction>) -> Result<()> {
        let tx = require_tx(tx, self)?;
        engine.queue().poke(tx, self.queue.as_deref()).await.map(|_| ())
    }
}

// ========================================
// rollback
// ========================================

#[derive(Debug)]
pub struct RollbackFromMilestone {
    pub milestone: String,
    /// Task whose failure asked for the rollback.
    pub trigger: String,
}

#[async_trait]
impl Job for RollbackFromMilestone {
    fn phase(&self) -> TransactionPhase {
        TransactionPhase::InProgress
    }

    fn task(&self) -> Option<&str> {
        Some(&self.trigger)
    }

    fn name(&self) -> &'static str {
        "rollback-from-milestone"
    }

    async fn run(&self, engine: &Engine, tx: Option<&mut Transaction>) -> Result<()> {
        let tx = require_tx(tx, self)?;
        let wave = engine
            .rollback()
            .rollback_from_milestone(tx, &self.milestone)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    milestone = %self.milestone,
                    trigger = %self.trigger,
                    error = %e,
                    "rollback planning failed"
                );
            })?;
        tracing::info!(milestone = %self.milestone, trigger = %self.trigger, size = wave.len(), "rollback wave planned");
        Ok(())
    }
}

// ========================================
// timed cancellation
// ========================================

/// Gives up on an unanswered stop request after a delay, unless the
/// clustered job was handed to another node meanwhile.
#[derive(Debug)]
pub struct TimeoutCancel {
    pub reference: ClusteredJobReference,
    pub epoch: u32,
    pub timeout: Duration,
}

impl TimeoutCancel {
    pub fn new(engine: &Engine, task: &Task, timeout_ms: u64) -> Self {
        Self {
            reference: ClusteredJobReference {
                id: engine.ids().clustered_job_id(),
                owner: engine.config().node_id.clone(),
                job_type: ClusteredJobType::CancelTimeout,
                task_name: task.name.clone(),
                telemetry: Some(json!({ "epoch": task.epoch(), "timeout_ms": timeout_ms })),
            },
            epoch: task.epoch(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

#[async_trait]
impl Job for TimeoutCancel {
    fn phase(&self) -> TransactionPhase {
        TransactionPhase::AfterSuccess
    }

    fn is_async(&self) -> bool {
        true
    }

    fn task(&self) -> Option<&str> {
        Some(&self.reference.task_name)
    }

    fn name(&self) -> &'static str {
        "timeout-cancel"
    }

    async fn run(&self, engine: &Engine, _tx: Option<&mut Transaction>) -> Result<()> {
        let holder = engine.resource_holder();
        let id = self.reference.id;
        holder.register_resource_locally(self.reference.clone());

        tokio::time::sleep(self.timeout).await;

        let result = if holder.is_owned(id) {
            let record = RecordTimeout {
                task: self.reference.task_name.clone(),
                epoch: self.epoch,
            };
            in_new_transaction(engine, Arc::new(record))
                .run(engine, None)
                .await
        } else {
            tracing::debug!(task = %self.reference.task_name, job = %id, "timer no longer owned here");
            Ok(())
        };

        holder.deregister_resource_locally(id);
        result
    }
}

#[derive(Debug)]
pub struct RecordTimeout {
    pub task: String,
    pub epoch: u32,
}

#[async_trait]
impl Job for RecordTimeout {
    fn phase(&self) -> TransactionPhase {
        TransactionPhase::InProgress
    }

    fn task(&self) -> Option<&str> {
        Some(&self.task)
    }

    fn name(&self) -> &'static str {
        "record-timeout"
    }

    async fn run(&self, engine: &Engine, tx: Option<&mut Transaction>) -> Result<()> {
        let tx = require_tx(tx, self)?;
        engine.controller().record_timeout(tx, &self.task, self.epoch).await
    }
}
