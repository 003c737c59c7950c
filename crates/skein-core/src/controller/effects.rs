//! Transition -> jobs.
//!
//! `before` is the task as it was right before the transition was applied,
//! `after` right after. Job order matters for in-progress jobs: they run in
//! the order returned here.

use std::sync::Arc;

use crate::domain::{State, StateGroup, StopFlag, Task, Transition};
use crate::engine::Engine;
use crate::jobs::lifecycle::{
    self, ClearConstraint, DecreaseRunningCounter, DependantEvent, DependencyEvent,
    InformDependants, InformDependencies, InvokeRemote, MarkForDisposal, NotifyCaller,
    RemoteCall, RollbackFromMilestone, TimeoutCancel,
};
use crate::jobs::{Job, JobChain, JobTree, Trigger};

pub(super) fn jobs_for(engine: &Engine, transition: Transition, before: &Task, after: &Task) -> Vec<Arc<dyn Job>> {
    let mut jobs: Vec<Arc<dyn Job>> = Vec::new();
    let name = &after.name;
    let from = transition.from();
    let to = transition.to();
    let queue = after.configuration.queue.clone();

    match to {
        State::Enqueued => jobs.push(lifecycle::poke(engine, queue.clone())),
        State::Starting => jobs.push(invoke(RemoteCall::Start, after)),
        State::StopRequested => {
            jobs.push(invoke(RemoteCall::Stop, after));
            if let Some(ms) = after.configuration.cancel_timeout_ms {
                jobs.push(Arc::new(TimeoutCancel::new(engine, after, ms)));
            }
        }
        State::RollbackRequested => jobs.push(invoke(RemoteCall::Rollback, after)),
        State::RollbackTriggered => {
            if let Some(milestone) = &after.milestone_task {
                let plan = RollbackFromMilestone {
                    milestone: milestone.clone(),
                    trigger: name.clone(),
                };
                jobs.push(
                    lifecycle::in_new_transaction(engine, Arc::new(plan))
                        .after_commit(false)
                        .into_job(),
                );
            }
        }
        _ => {}
    }

    if from.group() == StateGroup::Running && to.group() != StateGroup::Running {
        jobs.push(Arc::new(DecreaseRunningCounter { queue: queue.clone() }));
        jobs.push(lifecycle::poke(engine, queue));
    }

    // messages back up the graph
    if matches!(to, State::Rolledback | State::RollbackFailed) && after.rollback_meta.awaited {
        let waiting: Vec<String> = after.dependencies.iter().cloned().collect();
        if !waiting.is_empty() {
            jobs.push(Arc::new(InformDependencies {
                task: name.clone(),
                dependencies: waiting,
                event: DependencyEvent::RolledBack,
            }));
        }
    }
    if transition == Transition::RolledbackToNew {
        if before.rollback_meta.primed_from == Some(State::Successful) {
            jobs.extend(inform_dependants(after, DependantEvent::Reset));
        }
        if before.rollback_meta.rollback_source {
            tracing::info!(task = %name, epoch = after.epoch(), "rollback wave restored its milestone");
        }
    }

    let dependant_event = dependant_event(to, after);
    let notify: Arc<dyn Job> = Arc::new(NotifyCaller {
        transition,
        task: after.clone(),
    });

    if to.is_final() && after.configuration.delay_dependants_for_final_notification {
        jobs.push(Arc::new(gated(engine, after, notify, dependant_event)));
        return jobs;
    }

    if let Some(event) = dependant_event {
        jobs.extend(inform_dependants(after, event));
    }
    if to.is_final() {
        let release = JobChain::new(Arc::new(ClearConstraint { task: name.clone() }))
            .then(Trigger::OnSuccess, Arc::new(MarkForDisposal { task: name.clone() }));
        jobs.push(Arc::new(release));
    }
    jobs.push(notify);
    jobs
}

fn invoke(call: RemoteCall, task: &Task) -> Arc<dyn Job> {
    Arc::new(InvokeRemote {
        call,
        task: task.clone(),
    })
}

/// What entering `to` tells the dependants, if anything.
fn dependant_event(to: State, task: &Task) -> Option<DependantEvent> {
    let cause = || task.stopped_cause.clone().unwrap_or_else(|| task.name.clone());
    match to {
        State::Successful => Some(DependantEvent::Succeeded),
        State::Failed | State::StartFailed | State::StopFailed | State::RollbackFailed => {
            Some(DependantEvent::Stopped {
                cause: task.name.clone(),
            })
        }
        State::Stopped => match task.stop_flag {
            StopFlag::Cancelled => Some(DependantEvent::Cancelled { cause: cause() }),
            StopFlag::DependencyFailed | StopFlag::DependencyNotifyFailed => {
                Some(DependantEvent::Stopped { cause: cause() })
            }
            StopFlag::None | StopFlag::Unsuccessful => None,
        },
        _ => None,
    }
}

fn inform_dependants(task: &Task, event: DependantEvent) -> Option<Arc<dyn Job>> {
    if task.dependants.is_empty() {
        return None;
    }
    Some(Arc::new(InformDependants {
        task: task.name.clone(),
        dependants: task.dependants.iter().cloned().collect(),
        event,
    }))
}

/// Caller notification gating what the dependants hear.
///
/// ```text
/// NotifyCaller ─ success ─> dependant message, ClearConstraint
///              ─ failure ─> dependency_notification_failed
///              ─ always  ─> MarkForDisposal
/// ```
fn gated(engine: &Engine, task: &Task, notify: Arc<dyn Job>, event: Option<DependantEvent>) -> JobTree {
    let own_tx = |job: Arc<dyn Job>| lifecycle::in_new_transaction(engine, job).into_job();
    let name = task.name.clone();

    let mut tree = JobTree::new(notify);
    if let Some(job) = event.and_then(|e| inform_dependants(task, e)) {
        tree.add(JobTree::ROOT, Trigger::OnSuccess, own_tx(job));
    }
    tree.add(
        JobTree::ROOT,
        Trigger::OnSuccess,
        own_tx(Arc::new(ClearConstraint { task: name.clone() })),
    );
    if let Some(job) = inform_dependants(task, DependantEvent::NotificationFailed) {
        tree.add(JobTree::ROOT, Trigger::OnFailure, own_tx(job));
    }
    tree.add(
        JobTree::ROOT,
        Trigger::Always,
        own_tx(Arc::new(MarkForDisposal { task: name })),
    );
    tree
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_engine;

    fn names(jobs: &[Arc<dyn Job>]) -> Vec<&'static str> {
        jobs.iter().map(|j| j.name()).collect()
    }

    fn moved(task: &Task, transition: Transition) -> (Task, Task) {
        let mut before = task.clone();
        before.state = transition.from();
        let mut after = before.clone();
        crate::domain::transition::apply(&mut after, transition, chrono::Utc::now());
        (before, after)
    }

    #[tokio::test]
    async fn entering_starting_invokes_the_worker() {
        let (engine, _) = test_engine();
        let (before, after) = moved(&Task::new("a"), Transition::EnqueuedToStarting);
        let jobs = jobs_for(&engine, Transition::EnqueuedToStarting, &before, &after);
        assert_eq!(names(&jobs), vec!["invoke-start", "notify-caller"]);
    }

    #[tokio::test]
    async fn success_informs_dependants_then_disposes() {
        let (engine, _) = test_engine();
        let mut task = Task::new("a");
        task.dependants.insert("b".into());
        let (before, after) = moved(&task, Transition::UpToSuccessful);

        let jobs = jobs_for(&engine, Transition::UpToSuccessful, &before, &after);
        assert_eq!(
            names(&jobs),
            vec![
                "decrease-running-counter",
                "poke-queue",
                "inform-dependants",
                "job-chain",
                "notify-caller",
            ]
        );
    }

    #[tokio::test]
    async fn delayed_notification_wraps_final_effects_in_a_tree() {
        let (engine, _) = test_engine();
        let mut task = Task::new("a");
        task.dependants.insert("b".into());
        task.configuration.delay_dependants_for_final_notification = true;
        let (before, after) = moved(&task, Transition::UpToFailed);

        let jobs = jobs_for(&engine, Transition::UpToFailed, &before, &after);
        assert_eq!(
            names(&jobs),
            vec!["decrease-running-counter", "poke-queue", "job-tree"]
        );
        assert!(jobs[2].is_async());
    }

    #[tokio::test]
    async fn stop_request_with_timeout_schedules_the_timer() {
        let (engine, _) = test_engine();
        let mut task = Task::new("a");
        task.configuration.cancel_timeout_ms = Some(10);
        let (before, after) = moved(&task, Transition::UpToStopRequested);

        let jobs = jobs_for(&engine, Transition::UpToStopRequested, &before, &after);
        assert_eq!(names(&jobs), vec!["invoke-stop", "timeout-cancel", "notify-caller"]);
    }

    #[test]
    fn cancelled_stop_keeps_the_original_cause() {
        let mut task = Task::new("b");
        task.stop_with(StopFlag::Cancelled, "a");
        assert_eq!(
            dependant_event(State::Stopped, &task),
            Some(DependantEvent::Cancelled { cause: "a".into() })
        );
    }
}
