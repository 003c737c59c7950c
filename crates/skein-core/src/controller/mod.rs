//! Controller - タスクを変更する唯一の入口
//!
//! Every operation follows the same shape:
//!
//! 1. read the task with its version through the transaction
//! 2. change it in memory
//! 3. run the transition function until it has nothing more to say
//! 4. CAS-write the task back
//! 5. dispatch the jobs every applied transition produced
//!
//! A CAS mismatch is `ConcurrentUpdate` and aborts the caller's
//! transaction; the controller never retries on its own.
//!
//! # Design note
//! Jobs are dispatched only after the write, so in-progress jobs that touch
//! this task again (disposal, cascading delete) read the updated value.

mod effects;

use crate::domain::response::classify;
use crate::domain::transition;
use crate::domain::{Callback, Mode, Origin, ServerResponse, State, StateGroup, StopFlag, Task, Verdict};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::jobs::lifecycle::{DependencyEvent, InformDependencies};
use crate::ports::Versioned;
use crate::store::Transaction;

/// Rollback fields the planner writes without running the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackPriming {
    /// Dependants that must finish their own rollback first.
    pub dependant_count: i32,
    /// Dependencies that will not be SUCCESSFUL once the wave is done.
    pub dependency_count: i32,
    pub skip_remote: bool,
    /// Dependencies counted this task and expect to hear back.
    pub awaited: bool,
}

pub struct Controller<'e> {
    engine: &'e Engine,
}

impl<'e> Controller<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Self { engine }
    }

    // ========================================
    // caller intent
    // ========================================

    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub async fn set_mode(&self, tx: &mut Transaction, name: &str, mode: Mode) -> Result<()> {
        let current = tx.load_task(name)?;
        let mut task = current.value.clone();
        if task.state.is_final() {
            tracing::debug!(task = name, state = %task.state, ?mode, "finished task keeps its mode");
            return Ok(());
        }

        match (task.controller_mode, mode) {
            (Mode::Cancel, Mode::Cancel) => {}
            (Mode::Cancel, requested) => {
                tracing::warn!(task = name, ?requested, "cancelled task cannot change mode");
                return Ok(());
            }
            (Mode::Active, Mode::Idle) if task.state != State::New => {
                return Err(EngineError::illegal(
                    name,
                    task.state,
                    "only a NEW task can go back to IDLE",
                ));
            }
            _ => {}
        }

        task.controller_mode = mode;
        if mode == Mode::Cancel {
            task.stop_with(StopFlag::Cancelled, name);
        }
        self.settle(tx, current, task).await
    }

    // ========================================
    // worker callbacks
    // ========================================

    #[tracing::instrument(level = "debug", skip(self, tx, callback), fields(epoch = callback.epoch))]
    pub async fn accept(&self, tx: &mut Transaction, name: &str, callback: Callback) -> Result<()> {
        self.respond(tx, name, callback, true).await
    }

    #[tracing::instrument(level = "debug", skip(self, tx, callback), fields(epoch = callback.epoch))]
    pub async fn fail(&self, tx: &mut Transaction, name: &str, callback: Callback) -> Result<()> {
        self.respond(tx, name, callback, false).await
    }

    async fn respond(&self, tx: &mut Transaction, name: &str, callback: Callback, positive: bool) -> Result<()> {
        let current = tx.load_task(name)?;
        match classify(&current.value, &callback) {
            Verdict::Record(state) => {
                let mut task = current.value.clone();
                task.server_responses.push(ServerResponse {
                    state,
                    positive,
                    rollback_counter: task.epoch(),
                    origin: Origin::Remote,
                    body: callback.body,
                });
                self.settle(tx, current, task).await
            }
            Verdict::Ignore(reason) => {
                tracing::warn!(task = name, state = %current.value.state, reason, "callback ignored");
                Ok(())
            }
            Verdict::Illegal(reason) => Err(EngineError::illegal(name, current.value.state, reason)),
        }
    }

    /// Result of the start/stop/rollback call itself.
    pub async fn record_invocation(
        &self,
        tx: &mut Transaction,
        name: &str,
        state: State,
        epoch: u32,
        positive: bool,
        body: serde_json::Value,
    ) -> Result<()> {
        let Some(current) = tx.get_task(name)? else {
            tracing::debug!(task = name, "invocation result for a deleted task");
            return Ok(());
        };
        if current.value.state != state || current.value.epoch() != epoch {
            tracing::debug!(
                task = name,
                expected = %state,
                actual = %current.value.state,
                "invocation result no longer applies"
            );
            return Ok(());
        }
        let mut task = current.value.clone();
        task.server_responses.push(ServerResponse {
            state,
            positive,
            rollback_counter: epoch,
            origin: Origin::Invocation,
            body,
        });
        self.settle(tx, current, task).await
    }

    /// A stop request went unanswered for too long.
    pub async fn record_timeout(&self, tx: &mut Transaction, name: &str, epoch: u32) -> Result<()> {
        let Some(current) = tx.get_task(name)? else {
            return Ok(());
        };
        let state = current.value.state;
        if !matches!(state, State::StopRequested | State::Stopping) || current.value.epoch() != epoch {
            tracing::debug!(task = name, state = %state, "stop resolved before the timeout");
            return Ok(());
        }
        tracing::warn!(task = name, state = %state, "stop request timed out");
        let mut task = current.value.clone();
        task.server_responses.push(ServerResponse {
            state,
            positive: false,
            rollback_counter: epoch,
            origin: Origin::Timeout,
            body: serde_json::json!({ "error": "stop timed out" }),
        });
        self.settle(tx, current, task).await
    }

    // ========================================
    // queue
    // ========================================

    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub async fn dequeue(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        let current = tx.load_task(name)?;
        if current.value.state != State::Enqueued {
            return Err(EngineError::illegal(
                name,
                current.value.state,
                "dequeue is only legal from ENQUEUED",
            ));
        }
        let mut task = current.value.clone();
        task.starting = true;
        self.settle(tx, current, task).await
    }

    // ========================================
    // dependency events
    // ========================================

    pub async fn dependency_succeeded(&self, tx: &mut Transaction, name: &str, dependency: &str) -> Result<()> {
        self.on_event(tx, name, dependency, |task| {
            task.unfinished_dependencies -= 1;
        })
        .await
    }

    pub async fn dependency_stopped(
        &self,
        tx: &mut Transaction,
        name: &str,
        dependency: &str,
        cause: &str,
    ) -> Result<()> {
        self.on_event(tx, name, dependency, |task| {
            task.stop_with(StopFlag::DependencyFailed, cause);
        })
        .await
    }

    pub async fn dependency_cancelled(
        &self,
        tx: &mut Transaction,
        name: &str,
        dependency: &str,
        cause: &str,
    ) -> Result<()> {
        self.on_event(tx, name, dependency, |task| {
            task.stop_with(StopFlag::Cancelled, cause);
        })
        .await
    }

    pub async fn dependency_notification_failed(
        &self,
        tx: &mut Transaction,
        name: &str,
        dependency: &str,
    ) -> Result<()> {
        self.on_event(tx, name, dependency, |task| {
            task.stop_with(StopFlag::DependencyNotifyFailed, dependency);
        })
        .await
    }

    /// A SUCCESSFUL dependency rolled back and will run again.
    ///
    /// # Design note
    /// The gate is recomputed from the dependencies' current states rather
    /// than incremented. Tasks that were primed (or re-primed) already
    /// count the dependency, and a recount is the same for them.
    pub async fn dependency_reset(&self, tx: &mut Transaction, name: &str, dependency: &str) -> Result<()> {
        let Some(current) = tx.get_task(name)? else {
            return Ok(());
        };
        if current.value.rollback_meta.to_rollback || current.value.state.group() != StateGroup::Idle {
            tracing::debug!(task = name, dependency, state = %current.value.state, "reset does not apply");
            return Ok(());
        }
        let mut unfinished = 0;
        for dep in &current.value.dependencies {
            if tx.get_task(dep)?.is_some_and(|d| d.value.state != State::Successful) {
                unfinished += 1;
            }
        }
        self.on_event(tx, name, dependency, |task| {
            task.unfinished_dependencies = unfinished;
        })
        .await
    }

    /// Cross-branch re-prime: a task already mid-rollback learns that one of
    /// its dependencies joined another wave.
    pub async fn dependency_is_to_rollback(&self, tx: &mut Transaction, name: &str, dependency: &str) -> Result<()> {
        let was_successful = tx
            .get_task(dependency)?
            .is_some_and(|d| d.value.state == State::Successful);
        self.on_event(tx, name, dependency, |task| {
            task.rollback_meta.awaited = true;
            if was_successful {
                task.unfinished_dependencies += 1;
            }
        })
        .await
    }

    pub async fn dependant_rolled_back(&self, tx: &mut Transaction, name: &str, dependant: &str) -> Result<()> {
        self.on_event(tx, name, dependant, |task| {
            if task.rollback_meta.to_rollback {
                task.rollback_meta.unrestored_dependants -= 1;
            }
        })
        .await
    }

    pub async fn dependant_deleted(&self, tx: &mut Transaction, name: &str, dependant: &str) -> Result<()> {
        self.on_event(tx, name, dependant, |task| {
            task.dependants.remove(dependant);
        })
        .await?;

        let cascade = tx
            .get_task(name)?
            .is_some_and(|t| t.value.disposable && t.value.dependants.is_empty());
        if cascade {
            self.delete(tx, name).await?;
        }
        Ok(())
    }

    /// Apply a neighbour's message. A recipient that is gone already is an
    /// expected race.
    async fn on_event<F>(&self, tx: &mut Transaction, name: &str, from: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Task) + Send,
    {
        let Some(current) = tx.get_task(name)? else {
            tracing::debug!(task = name, from, "recipient no longer exists");
            return Ok(());
        };
        let mut task = current.value.clone();
        mutate(&mut task);
        self.settle(tx, current, task).await
    }

    // ========================================
    // disposal
    // ========================================

    pub async fn mark_for_disposal(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        let Some(current) = tx.get_task(name)? else {
            return Ok(());
        };
        if !current.value.state.is_final() {
            tracing::debug!(task = name, state = %current.value.state, "left FINAL before disposal");
            return Ok(());
        }
        let mut task = current.value.clone();
        task.disposable = true;
        let dependant_free = task.dependants.is_empty();
        self.write(tx, current, task)?;

        if dependant_free && self.engine.config().delete_on_dispose {
            self.delete(tx, name).await?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub async fn delete(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        let Some(current) = tx.get_task(name)? else {
            tracing::debug!(task = name, "already deleted");
            return Ok(());
        };
        let task = &current.value;
        if !task.disposable || !task.dependants.is_empty() {
            return Err(EngineError::illegal(
                name,
                task.state,
                format!(
                    "only disposable tasks without dependants can be deleted ({} dependants left)",
                    task.dependants.len()
                ),
            ));
        }
        if !tx.cas_delete_task(name, current.version)? {
            return Err(EngineError::concurrent(format!("task:{name}")));
        }
        self.release_constraint(tx, task)?;
        tracing::info!(task = name, "task deleted");

        if !task.dependencies.is_empty() {
            let job = InformDependencies {
                task: name.to_string(),
                dependencies: task.dependencies.iter().cloned().collect(),
                event: DependencyEvent::Deleted,
            };
            self.engine.dispatch(tx, std::sync::Arc::new(job)).await?;
        }
        Ok(())
    }

    pub async fn clear_constraint(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        let Some(current) = tx.get_task(name)? else {
            return Ok(());
        };
        self.release_constraint(tx, &current.value)
    }

    fn release_constraint(&self, tx: &mut Transaction, task: &Task) -> Result<()> {
        let Some(constraint) = &task.constraint else {
            return Ok(());
        };
        let Some(held) = tx.get_constraint(constraint)? else {
            return Ok(());
        };
        if held.value != task.name {
            return Ok(());
        }
        if !tx.cas_delete_constraint(constraint, held.version)? {
            return Err(EngineError::concurrent(format!("constraint:{constraint}")));
        }
        tracing::debug!(task = %task.name, constraint = %constraint, "constraint released");
        Ok(())
    }

    // ========================================
    // rollback planner helpers
    // ========================================

    /// Write rollback counters without running the transition function.
    pub async fn prime_for_rollback(&self, tx: &mut Transaction, name: &str, priming: RollbackPriming) -> Result<()> {
        let current = tx.load_task(name)?;
        let mut task = current.value.clone();
        let meta = &mut task.rollback_meta;
        meta.to_rollback = true;
        meta.unrestored_dependants = priming.dependant_count;
        meta.skip_remote_rollback = priming.skip_remote;
        meta.awaited = priming.awaited;
        meta.primed_from = Some(task.state);
        task.unfinished_dependencies = priming.dependency_count;
        tracing::debug!(task = name, ?priming, "primed for rollback");
        self.write(tx, current, task)
    }

    pub async fn mark_rollback_source(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        let current = tx.load_task(name)?;
        let mut task = current.value.clone();
        task.rollback_meta.rollback_source = true;
        self.write(tx, current, task)
    }

    /// Run the transition loop only.
    pub async fn kick(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        let current = tx.load_task(name)?;
        let task = current.value.clone();
        self.settle(tx, current, task).await
    }

    // ========================================
    // core loop
    // ========================================

    /// Run transitions to a fixpoint, write, then dispatch the jobs.
    async fn settle(&self, tx: &mut Transaction, current: Versioned<Task>, mut task: Task) -> Result<()> {
        let limit = self.engine.config().max_transitions_per_update;
        let mut jobs = Vec::new();
        let mut applied = 0;

        while let Some(next) = transition::next(&task) {
            applied += 1;
            if applied > limit {
                return Err(EngineError::Internal(format!(
                    "{} did not settle after {limit} transitions",
                    task.name
                )));
            }
            let before = task.clone();
            transition::apply(&mut task, next, self.engine.clock().now());
            tracing::info!(task = %task.name, from = %next.from(), to = %next.to(), epoch = task.epoch(), "transition");
            jobs.extend(effects::jobs_for(self.engine, next, &before, &task));
        }

        self.write(tx, current, task)?;
        for job in jobs {
            self.engine.dispatch(tx, job).await?;
        }
        Ok(())
    }

    fn write(&self, tx: &mut Transaction, current: Versioned<Task>, task: Task) -> Result<()> {
        let name = task.name.clone();
        if !tx.cas_replace_task(task, current.version)? {
            return Err(EngineError::concurrent(format!("task:{name}")));
        }
        Ok(())
    }
}
