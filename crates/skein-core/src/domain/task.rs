//! Task - オーケストレーション対象の DAG ノード
//!
//! `Task` is the single source of truth for one node of a graph. It is only
//! ever mutated through the controller, which reads it with its version,
//! changes it in memory and writes it back with CAS.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::response::Origin;
use super::state::{Mode, State, StateGroup, StopFlag};
use super::transition::Transition;

/// Opaque request the remote worker / notifier receive. The core never
/// interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub endpoint: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RemoteRequest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            payload: serde_json::Value::Null,
        }
    }
}

/// Per-task knobs supplied at install time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfiguration {
    /// Named queue; `None` is the default queue.
    pub queue: Option<String>,

    /// Dependants are informed of the final state only after the caller
    /// notification for that transition succeeded.
    pub delay_dependants_for_final_notification: bool,

    /// How many times this task may trigger a rollback of its milestone.
    pub rollback_limit: u32,

    /// Forces STOP_FAILED when a stop request is not answered in time.
    pub cancel_timeout_ms: Option<u64>,
}

impl Default for TaskConfiguration {
    fn default() -> Self {
        Self {
            queue: None,
            delay_dependants_for_final_notification: false,
            rollback_limit: 3,
            cancel_timeout_ms: None,
        }
    }
}

/// Rollback bookkeeping.
///
/// # Design note
/// `unrestored_dependants` counts dependants that still have to finish their
/// own rollback before this task may roll back. `awaited` tells the task that
/// its dependencies counted it in their `unrestored_dependants`, so it must
/// report back once it is rolled back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackMeta {
    pub to_rollback: bool,
    pub rollback_source: bool,
    pub trigger_counter: u32,
    pub rollback_counter: u32,
    pub unrestored_dependants: i32,
    pub awaited: bool,
    pub skip_remote_rollback: bool,
    /// State the task was in when the planner primed it.
    pub primed_from: Option<State>,
}

/// One callback from the remote worker (or from an invocation job).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerResponse {
    /// The state this response resolves.
    pub state: State,
    pub positive: bool,
    pub rollback_counter: u32,
    pub origin: Origin,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// One applied transition and when it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionTime {
    pub transition: Transition,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub state: State,
    pub controller_mode: Mode,
    pub stop_flag: StopFlag,
    pub stopped_cause: Option<String>,

    /// Tasks this one waits for.
    pub dependencies: BTreeSet<String>,
    /// Tasks waiting for this one.
    pub dependants: BTreeSet<String>,
    pub unfinished_dependencies: i32,

    /// Latch set by the queue controller on dequeue.
    pub starting: bool,

    pub rollback_meta: RollbackMeta,
    pub server_responses: Vec<ServerResponse>,
    pub timestamps: Vec<TransitionTime>,
    pub disposable: bool,
    pub constraint: Option<String>,
    pub milestone_task: Option<String>,
    pub configuration: TaskConfiguration,

    pub remote_start: RemoteRequest,
    pub remote_cancel: RemoteRequest,
    pub remote_rollback: Option<RemoteRequest>,
    pub caller_notifications: Option<RemoteRequest>,
    pub correlation_id: Option<String>,
}

impl Task {
    /// A bare NEW task, mostly for tests and the install path.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            remote_start: RemoteRequest::new(format!("start/{name}")),
            remote_cancel: RemoteRequest::new(format!("stop/{name}")),
            name,
            state: State::New,
            controller_mode: Mode::Idle,
            stop_flag: StopFlag::None,
            stopped_cause: None,
            dependencies: BTreeSet::new(),
            dependants: BTreeSet::new(),
            unfinished_dependencies: 0,
            starting: false,
            rollback_meta: RollbackMeta::default(),
            server_responses: Vec::new(),
            timestamps: Vec::new(),
            disposable: false,
            constraint: None,
            milestone_task: None,
            configuration: TaskConfiguration::default(),
            remote_rollback: None,
            caller_notifications: None,
            correlation_id: None,
        }
    }

    /// Current rollback epoch.
    pub fn epoch(&self) -> u32 {
        self.rollback_meta.rollback_counter
    }

    pub fn queue(&self) -> Option<&str> {
        self.configuration.queue.as_deref()
    }

    /// Latest response recorded for `state` in the current epoch.
    pub fn latest_response(&self, state: State) -> Option<&ServerResponse> {
        let epoch = self.epoch();
        self.server_responses
            .iter()
            .rev()
            .find(|r| r.state == state && r.rollback_counter == epoch)
    }

    /// True when a failure may still trigger a rollback of the milestone.
    pub fn can_trigger_rollback(&self) -> bool {
        self.milestone_task.is_some()
            && self.rollback_meta.trigger_counter < self.configuration.rollback_limit
    }

    /// Set the stop flag unless one is already recorded. The first cause wins.
    pub fn stop_with(&mut self, flag: StopFlag, cause: &str) -> bool {
        if self.stop_flag.is_set() {
            return false;
        }
        self.stop_flag = flag;
        self.stopped_cause = Some(cause.to_string());
        true
    }

    /// Nothing was done remotely that a rollback would have to undo.
    pub fn is_safe_for_rollback(&self) -> bool {
        match self.state.group() {
            StateGroup::Idle | StateGroup::Queued => true,
            _ if self.state == State::Stopped => self
                .timestamps
                .last()
                .map(|t| {
                    matches!(
                        t.transition.from().group(),
                        StateGroup::Idle | StateGroup::Queued
                    )
                })
                .unwrap_or(true),
            _ => false,
        }
    }

    /// Clear everything a replay must not inherit. Keeps the primed
    /// `unfinished_dependencies`.
    pub fn reset_for_replay(&mut self) {
        self.state = State::New;
        self.starting = false;
        self.stop_flag = StopFlag::None;
        self.stopped_cause = None;
        self.disposable = false;
        let meta = &mut self.rollback_meta;
        meta.rollback_counter += 1;
        meta.to_rollback = false;
        meta.rollback_source = false;
        meta.primed_from = None;
        meta.unrestored_dependants = 0;
        meta.awaited = false;
        meta.skip_remote_rollback = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(state: State, epoch: u32, positive: bool) -> ServerResponse {
        ServerResponse {
            state,
            positive,
            rollback_counter: epoch,
            origin: Origin::Remote,
            body: serde_json::Value::Null,
        }
    }

    #[test]
    fn latest_response_ignores_other_epochs() {
        let mut task = Task::new("a");
        task.server_responses.push(response(State::Up, 0, false));
        task.rollback_meta.rollback_counter = 1;
        assert!(task.latest_response(State::Up).is_none());

        task.server_responses.push(response(State::Up, 1, true));
        assert!(task.latest_response(State::Up).is_some_and(|r| r.positive));
    }

    #[test]
    fn first_stop_cause_wins() {
        let mut task = Task::new("a");
        assert!(task.stop_with(StopFlag::DependencyFailed, "b"));
        assert!(!task.stop_with(StopFlag::Cancelled, "a"));
        assert_eq!(task.stop_flag, StopFlag::DependencyFailed);
        assert_eq!(task.stopped_cause.as_deref(), Some("b"));
    }

    #[test]
    fn rollback_budget_needs_a_milestone() {
        let mut task = Task::new("a");
        assert!(!task.can_trigger_rollback());
        task.milestone_task = Some("m".into());
        task.configuration.rollback_limit = 1;
        assert!(task.can_trigger_rollback());
        task.rollback_meta.trigger_counter = 1;
        assert!(!task.can_trigger_rollback());
    }

    #[test]
    fn reset_for_replay_bumps_epoch_and_keeps_primed_counter() {
        let mut task = Task::new("a");
        task.state = State::Rolledback;
        task.unfinished_dependencies = 2;
        task.rollback_meta.to_rollback = true;
        task.rollback_meta.awaited = true;
        task.stop_flag = StopFlag::Unsuccessful;

        task.reset_for_replay();

        assert_eq!(task.state, State::New);
        assert_eq!(task.epoch(), 1);
        assert_eq!(task.unfinished_dependencies, 2);
        assert!(!task.rollback_meta.to_rollback);
        assert!(!task.rollback_meta.awaited);
        assert_eq!(task.stop_flag, StopFlag::None);
    }
}
