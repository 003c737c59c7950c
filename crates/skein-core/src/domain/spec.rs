//! Spec - インストール要求（バッチ）の定義
//!
//! `CreateGraphRequest` is what a caller submits: a set of new task
//! declarations plus edges. Edges may point at tasks installed earlier.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::state::Mode;
use super::task::{RemoteRequest, Task, TaskConfiguration};

/// `dependant` waits for `dependency`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub dependant: String,
    pub dependency: String,
}

impl Edge {
    pub fn new(dependant: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self {
            dependant: dependant.into(),
            dependency: dependency.into(),
        }
    }
}

/// Declaration of one new task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTask {
    pub name: String,
    #[serde(default)]
    pub controller_mode: Mode,
    pub remote_start: RemoteRequest,
    pub remote_cancel: RemoteRequest,
    #[serde(default)]
    pub remote_rollback: Option<RemoteRequest>,
    #[serde(default)]
    pub caller_notifications: Option<RemoteRequest>,
    #[serde(default)]
    pub configuration: TaskConfiguration,
    #[serde(default)]
    pub constraint: Option<String>,
    #[serde(default)]
    pub milestone_task: Option<String>,
}

impl CreateTask {
    /// Declaration with generated endpoints and default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            remote_start: RemoteRequest::new(format!("start/{name}")),
            remote_cancel: RemoteRequest::new(format!("stop/{name}")),
            name,
            controller_mode: Mode::Idle,
            remote_rollback: None,
            caller_notifications: None,
            configuration: TaskConfiguration::default(),
            constraint: None,
            milestone_task: None,
        }
    }

    pub fn active(mut self) -> Self {
        self.controller_mode = Mode::Active;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.configuration.queue = Some(queue.into());
        self
    }

    pub fn constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    pub fn milestone(mut self, milestone: impl Into<String>) -> Self {
        self.milestone_task = Some(milestone.into());
        self
    }

    pub fn rollback_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.remote_rollback = Some(RemoteRequest::new(endpoint));
        self
    }

    pub fn notify(mut self, endpoint: impl Into<String>) -> Self {
        self.caller_notifications = Some(RemoteRequest::new(endpoint));
        self
    }

    pub fn into_task(self, correlation_id: Option<String>) -> Task {
        let mut task = Task::new(self.name);
        task.controller_mode = self.controller_mode;
        task.remote_start = self.remote_start;
        task.remote_cancel = self.remote_cancel;
        task.remote_rollback = self.remote_rollback;
        task.caller_notifications = self.caller_notifications;
        task.configuration = self.configuration;
        task.constraint = self.constraint;
        task.milestone_task = self.milestone_task;
        task.correlation_id = correlation_id;
        task
    }
}

/// A batch of tasks and edges installed in one transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateGraphRequest {
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Keyed by task name.
    #[serde(default)]
    pub vertices: BTreeMap<String, CreateTask>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl CreateGraphRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(mut self, task: CreateTask) -> Self {
        self.vertices.insert(task.name.clone(), task);
        self
    }

    /// `dependant` waits for `dependency`.
    pub fn edge(mut self, dependant: &str, dependency: &str) -> Self {
        self.edges.push(Edge::new(dependant, dependency));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_deserializes_with_defaults() {
        let json = serde_json::json!({
            "vertices": {
                "a": {
                    "name": "a",
                    "remote_start": { "endpoint": "http://w/start" },
                    "remote_cancel": { "endpoint": "http://w/stop" }
                }
            },
            "edges": []
        });
        let batch: CreateGraphRequest = serde_json::from_value(json).unwrap();
        let a = &batch.vertices["a"];
        assert_eq!(a.controller_mode, Mode::Idle);
        assert_eq!(a.configuration.rollback_limit, 3);
        assert!(a.milestone_task.is_none());
    }

    #[test]
    fn into_task_carries_declaration() {
        let task = CreateTask::new("a")
            .active()
            .queue("q")
            .milestone("m")
            .into_task(Some("corr".into()));
        assert_eq!(task.controller_mode, Mode::Active);
        assert_eq!(task.queue(), Some("q"));
        assert_eq!(task.milestone_task.as_deref(), Some("m"));
        assert_eq!(task.correlation_id.as_deref(), Some("corr"));
    }
}
