//! Rollback - マイルストーンからのロールバック計画
//!
//! Given a milestone, the planner collects the milestone and everything
//! downstream of it, primes each candidate's counters in dependency order
//! and kicks the wave off. From there the state machine does the rest:
//! leaves roll back first, and each rolled-back task reports to the
//! dependencies that wait for it.
//!
//! # Design note
//! Priming writes counters without running transitions. The wave only
//! starts moving in the final kick pass, after every counter is in place,
//! so no task can observe a half-primed neighbourhood.

use std::collections::BTreeSet;

use crate::controller::RollbackPriming;
use crate::domain::{Mode, State, StateGroup, StopFlag, Task};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::graph::TaskGraph;
use crate::store::Transaction;

pub struct RollbackPlanner<'e> {
    engine: &'e Engine,
}

impl<'e> RollbackPlanner<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Self { engine }
    }

    /// Plan and start a rollback wave; returns its members in dependency
    /// order.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub async fn rollback_from_milestone(&self, tx: &mut Transaction, milestone: &str) -> Result<Vec<String>> {
        let root = tx.load_task(milestone)?;
        if !matches!(root.value.state, State::Successful | State::RollbackTriggered) {
            return Err(EngineError::illegal(
                milestone,
                root.value.state,
                "a rollback can only restart from a SUCCESSFUL or ROLLBACK_TRIGGERED milestone",
            ));
        }

        let graph = self.engine.graph().task_graph(tx, &[milestone])?;
        let candidates = candidates(&graph, milestone);
        if !candidates.contains(milestone) {
            return Err(EngineError::MilestoneUnreachable {
                task: milestone.to_string(),
                milestone: milestone.to_string(),
            });
        }

        // every neighbour is validated at commit
        for name in &candidates {
            if let Some(task) = graph.task(name) {
                for neighbour in task.dependencies.iter().chain(task.dependants.iter()) {
                    tx.pull_task(neighbour)?;
                }
            }
        }

        let order = graph.topological_order(&candidates)?;
        let controller = self.engine.controller();
        let mut cross_branch: Vec<(String, String)> = Vec::new();

        for name in &order {
            let task = graph
                .task(name)
                .ok_or_else(|| EngineError::Internal(format!("{name} missing from its own graph")))?;

            let mut dependant_count = 0;
            for dependant in &task.dependants {
                let Some(other) = graph.task(dependant) else {
                    continue;
                };
                if candidates.contains(dependant) {
                    if holds_up_rollback(other) {
                        dependant_count += 1;
                    }
                } else if other.rollback_meta.to_rollback || other.state.is_mid_rollback() {
                    dependant_count += 1;
                    cross_branch.push((dependant.clone(), name.clone()));
                }
            }

            let dependency_count = task
                .dependencies
                .iter()
                .filter(|dep| {
                    candidates.contains(*dep)
                        || graph.task(dep).is_some_and(|d| d.state != State::Successful)
                })
                .count() as i32;

            let priming = RollbackPriming {
                dependant_count,
                dependency_count,
                skip_remote: task.remote_rollback.is_none() || task.is_safe_for_rollback(),
                awaited: holds_up_rollback(task),
            };
            controller.prime_for_rollback(tx, name, priming).await?;
        }

        for (dependant, dependency) in &cross_branch {
            tracing::debug!(dependant, dependency, "re-priming task of another wave");
            controller
                .dependency_is_to_rollback(tx, dependant, dependency)
                .await?;
        }

        controller.mark_rollback_source(tx, milestone).await?;
        for name in order.iter().rev() {
            controller.kick(tx, name).await?;
        }

        tracing::info!(milestone, size = order.len(), "rollback wave started");
        Ok(order)
    }
}

/// Whether dependencies have to wait for this task to report back: it has
/// something to undo (or is already on its way out).
fn holds_up_rollback(task: &Task) -> bool {
    matches!(
        task.state.group(),
        StateGroup::Running | StateGroup::Final | StateGroup::RollbackTodo
    )
}

/// Tasks already taken by another wave.
fn busy(task: &Task) -> bool {
    task.rollback_meta.to_rollback || task.state.is_mid_rollback()
}

fn excluded(task: &Task) -> bool {
    busy(task) || task.controller_mode == Mode::Cancel || task.stop_flag == StopFlag::Cancelled
}

/// The milestone and its transitive dependants, minus tasks that are busy
/// elsewhere and tasks stopped by a failure the wave cannot reach. The
/// milestone itself is judged by its state only: it stays unless busy.
fn candidates(graph: &TaskGraph, milestone: &str) -> BTreeSet<String> {
    let mut set: BTreeSet<String> = graph
        .dependants_closure(milestone)
        .into_iter()
        .filter(|name| {
            graph.task(name).is_some_and(|t| {
                if name.as_str() == milestone {
                    !busy(t)
                } else {
                    !excluded(t)
                }
            })
        })
        .collect();

    let unreachable: Vec<String> = set
        .iter()
        .filter(|name| {
            name.as_str() != milestone
                && graph.task(name).is_some_and(|t| {
                    t.stop_flag.is_caused_by_failure()
                        && t.stopped_cause
                            .as_ref()
                            .is_some_and(|cause| !set.contains(cause))
                })
        })
        .cloned()
        .collect();
    for name in unreachable {
        tracing::info!(task = %name, "stopped by a failure outside the wave, left alone");
        set.remove(&name);
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn graph(tasks: Vec<Task>, edges: &[(&str, &str)]) -> TaskGraph {
        let mut map: BTreeMap<String, Task> = tasks.into_iter().map(|t| (t.name.clone(), t)).collect();
        for (dependant, dependency) in edges {
            if let Some(t) = map.get_mut(*dependant) {
                t.dependencies.insert(dependency.to_string());
            }
            if let Some(t) = map.get_mut(*dependency) {
                t.dependants.insert(dependant.to_string());
            }
        }
        TaskGraph::build(map)
    }

    fn in_state(name: &str, state: State) -> Task {
        let mut task = Task::new(name);
        task.state = state;
        task
    }

    #[test]
    fn stop_cause_outside_the_wave_excludes_the_task() {
        // m <- a <- b, with b also depending on the unrelated c
        let mut b = in_state("b", State::Stopped);
        b.stop_with(StopFlag::DependencyFailed, "c");
        let g = graph(
            vec![
                in_state("m", State::Successful),
                in_state("a", State::Successful),
                b,
                in_state("c", State::Failed),
            ],
            &[("a", "m"), ("b", "a"), ("b", "c")],
        );

        let set = candidates(&g, "m");
        assert_eq!(set, BTreeSet::from(["m".to_string(), "a".to_string()]));
    }

    #[test]
    fn stop_cause_inside_the_wave_keeps_the_task() {
        let mut b = in_state("b", State::Stopped);
        b.stop_with(StopFlag::DependencyFailed, "a");
        let g = graph(
            vec![in_state("m", State::Successful), in_state("a", State::Failed), b],
            &[("a", "m"), ("b", "a")],
        );

        assert_eq!(candidates(&g, "m").len(), 3);
    }

    #[test]
    fn cancelled_and_busy_tasks_are_skipped() {
        let mut cancelled = in_state("x", State::Stopped);
        cancelled.controller_mode = Mode::Cancel;
        let mut busy = in_state("y", State::ToRollback);
        busy.rollback_meta.to_rollback = true;
        let g = graph(
            vec![in_state("m", State::Successful), cancelled, busy],
            &[("x", "m"), ("y", "m")],
        );

        assert_eq!(candidates(&g, "m"), BTreeSet::from(["m".to_string()]));
    }

    #[test]
    fn cancelled_milestone_still_leads_its_wave() {
        let mut m = in_state("m", State::Successful);
        m.controller_mode = Mode::Cancel;
        m.stop_flag = StopFlag::Cancelled;
        let g = graph(vec![m, in_state("a", State::Up)], &[("a", "m")]);

        assert_eq!(
            candidates(&g, "m"),
            BTreeSet::from(["m".to_string(), "a".to_string()])
        );
    }

    #[test]
    fn busy_milestone_is_not_a_candidate() {
        let mut m = in_state("m", State::Successful);
        m.rollback_meta.to_rollback = true;
        let g = graph(vec![m, in_state("a", State::Up)], &[("a", "m")]);

        assert!(!candidates(&g, "m").contains("m"));
    }

    #[test]
    fn only_started_tasks_hold_up_their_dependencies() {
        assert!(!holds_up_rollback(&in_state("a", State::Waiting)));
        assert!(!holds_up_rollback(&in_state("a", State::Enqueued)));
        assert!(holds_up_rollback(&in_state("a", State::Up)));
        assert!(holds_up_rollback(&in_state("a", State::Successful)));
        assert!(holds_up_rollback(&in_state("a", State::RollbackTriggered)));
    }
}
