//! Graph container - バッチのインストールと成分の読み出し
//!
//! `install` validates a batch, links its edges into both endpoints,
//! persists new and touched tasks with CAS, rejects cycles, acquires
//! constraints and activates what was asked to be active. All of it happens
//! inside the caller's transaction, so a rejected batch leaves nothing
//! behind.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::TaskGraph;
use crate::domain::{CreateGraphRequest, Mode, State, StateGroup, Task};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::jobs::lifecycle;
use crate::ports::Versioned;
use crate::store::Transaction;

pub struct GraphContainer<'e> {
    engine: &'e Engine,
}

/// Tasks being written by one install: fresh ones and existing ones the
/// batch links to.
#[derive(Default)]
struct Staged {
    fresh: BTreeMap<String, Task>,
    existing: BTreeMap<String, Versioned<Task>>,
}

impl Staged {
    fn get(&self, name: &str) -> Option<&Task> {
        self.fresh
            .get(name)
            .or_else(|| self.existing.get(name).map(|v| &v.value))
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Task> {
        match self.fresh.get_mut(name) {
            Some(task) => Some(task),
            None => self.existing.get_mut(name).map(|v| &mut v.value),
        }
    }

    /// Make sure `name` is known, reading it from the store if needed.
    fn resolve(&mut self, tx: &mut Transaction, name: &str) -> Result<bool> {
        if self.get(name).is_some() {
            return Ok(true);
        }
        match tx.get_task(name)? {
            Some(existing) => {
                self.existing.insert(name.to_string(), existing);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl<'e> GraphContainer<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Self { engine }
    }

    /// Install a batch; returns the names of the tasks it created.
    pub async fn install(&self, tx: &mut Transaction, batch: CreateGraphRequest) -> Result<Vec<String>> {
        validate(&batch)?;

        let correlation_id = batch.correlation_id.clone();
        let mut staged = Staged::default();
        for (name, spec) in batch.vertices {
            staged
                .fresh
                .insert(name, spec.into_task(correlation_id.clone()));
        }

        for edge in &batch.edges {
            if edge.dependant == edge.dependency {
                return Err(EngineError::Validation(format!(
                    "{} cannot depend on itself",
                    edge.dependant
                )));
            }
            for endpoint in [&edge.dependant, &edge.dependency] {
                if !staged.resolve(tx, endpoint)? {
                    return Err(EngineError::Validation(format!(
                        "edge {} -> {} references unknown task {endpoint}",
                        edge.dependant, edge.dependency
                    )));
                }
            }
            self.link(&mut staged, &edge.dependant, &edge.dependency)?;
        }

        let created: Vec<String> = staged.fresh.keys().cloned().collect();
        for task in staged.fresh.values() {
            if tx.cas_create_task(task.clone())?.is_some() {
                return Err(EngineError::TaskConflict {
                    name: task.name.clone(),
                });
            }
        }
        for (name, touched) in &staged.existing {
            if !tx.cas_replace_task(touched.value.clone(), touched.version)? {
                return Err(EngineError::concurrent(format!("task:{name}")));
            }
        }

        let touched: Vec<&str> = staged
            .fresh
            .keys()
            .chain(staged.existing.keys())
            .map(String::as_str)
            .collect();
        let graph = self.task_graph(tx, &touched)?;
        if let Some(cycle) = graph.find_cycle() {
            tracing::warn!(cycle = ?cycle, "install rejected, graph would contain a cycle");
            return Err(EngineError::CycleDetected { cycle });
        }

        for task in staged.fresh.values() {
            if let Some(milestone) = &task.milestone_task
                && !graph
                    .dependencies_closure(&task.name)
                    .iter()
                    .any(|ancestor| ancestor == milestone)
            {
                return Err(EngineError::MilestoneUnreachable {
                    task: task.name.clone(),
                    milestone: milestone.clone(),
                });
            }
        }

        for task in staged.fresh.values() {
            if let Some(constraint) = &task.constraint
                && let Some(holder) = tx.cas_create_constraint(constraint, &task.name)?
            {
                return Err(EngineError::ConstraintConflict {
                    constraint: constraint.clone(),
                    holder: holder.value,
                });
            }
        }

        let controller = self.engine.controller();
        for task in staged.fresh.values() {
            if task.controller_mode == Mode::Active {
                controller.set_mode(tx, &task.name, Mode::Active).await?;
            }
        }

        let queues: BTreeSet<Option<String>> = staged
            .fresh
            .values()
            .map(|t| t.configuration.queue.clone())
            .collect();
        for queue in queues {
            self.engine
                .dispatch(tx, lifecycle::poke(self.engine, queue))
                .await?;
        }

        tracing::info!(
            tx = %tx.id(),
            created = created.len(),
            linked = staged.existing.len(),
            edges = batch.edges.len(),
            "graph installed"
        );
        Ok(created)
    }

    /// Mirror one edge into both endpoints.
    fn link(&self, staged: &mut Staged, dependant: &str, dependency: &str) -> Result<()> {
        let dependency_state = staged
            .get(dependency)
            .map(|t| t.state)
            .ok_or_else(|| EngineError::Internal(format!("{dependency} was not resolved")))?;
        if dependency_state.is_failed_final() {
            return Err(EngineError::Validation(format!(
                "{dependant} cannot depend on {dependency}, which ended in {dependency_state}"
            )));
        }

        let target = staged
            .get_mut(dependant)
            .ok_or_else(|| EngineError::Internal(format!("{dependant} was not resolved")))?;
        if target.state.group() != StateGroup::Idle {
            return Err(EngineError::Validation(format!(
                "{dependant} is already {} and cannot gain dependencies",
                target.state
            )));
        }
        if !target.dependencies.insert(dependency.to_string()) {
            tracing::debug!(dependant, dependency, "edge already present");
            return Ok(());
        }
        if dependency_state != State::Successful {
            target.unfinished_dependencies += 1;
        }

        if let Some(source) = staged.get_mut(dependency) {
            source.dependants.insert(dependant.to_string());
        }
        Ok(())
    }

    /// Snapshot of the connected components containing `roots`, read
    /// through `tx`.
    pub fn task_graph(&self, tx: &mut Transaction, roots: &[&str]) -> Result<TaskGraph> {
        let mut tasks: BTreeMap<String, Task> = BTreeMap::new();
        let mut frontier: VecDeque<String> = roots.iter().map(|r| r.to_string()).collect();

        while let Some(name) = frontier.pop_front() {
            if tasks.contains_key(&name) {
                continue;
            }
            let Some(current) = tx.get_task(&name)? else {
                continue;
            };
            let task = current.value;
            for neighbour in task.dependencies.iter().chain(task.dependants.iter()) {
                if !tasks.contains_key(neighbour) {
                    frontier.push_back(neighbour.clone());
                }
            }
            tasks.insert(name, task);
        }
        Ok(TaskGraph::build(tasks))
    }
}

fn validate(batch: &CreateGraphRequest) -> Result<()> {
    if batch.vertices.is_empty() && batch.edges.is_empty() {
        return Err(EngineError::Validation("empty batch".into()));
    }
    for (key, spec) in &batch.vertices {
        if spec.name.is_empty() {
            return Err(EngineError::Validation("task name must not be empty".into()));
        }
        if *key != spec.name {
            return Err(EngineError::Validation(format!(
                "vertex {key} carries task {}",
                spec.name
            )));
        }
        if spec.configuration.delay_dependants_for_final_notification
            && spec.caller_notifications.is_none()
        {
            return Err(EngineError::Validation(format!(
                "{key} delays dependants on a notification it never sends"
            )));
        }
        if spec.milestone_task.as_deref() == Some(key.as_str()) {
            return Err(EngineError::Validation(format!(
                "{key} cannot be its own milestone"
            )));
        }
    }
    Ok(())
}
