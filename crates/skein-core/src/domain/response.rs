//! Server responses: who sent them and whether the task is waiting for one.

use serde::{Deserialize, Serialize};

use super::state::{Mode, State, StateGroup, StopFlag};
use super::task::Task;

/// Where a response came from.
///
/// - `Invocation`: result of the start/stop/rollback call itself
/// - `Remote`: the worker's asynchronous callback
/// - `Timeout`: a timed cancellation gave up waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Origin {
    Invocation,
    Remote,
    Timeout,
}

impl Origin {
    /// Responses produced by the engine itself rather than the worker.
    pub fn is_engine(self) -> bool {
        !matches!(self, Origin::Remote)
    }
}

/// Worker callback as handed to `accept` / `fail`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callback {
    /// Rollback epoch the worker was invoked in.
    pub epoch: u32,
    /// The callback answers a rollback invocation.
    #[serde(default)]
    pub rollback: bool,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Callback {
    pub fn new(epoch: u32) -> Self {
        Self {
            epoch,
            rollback: false,
            body: serde_json::Value::Null,
        }
    }

    pub fn rollback(epoch: u32) -> Self {
        Self {
            rollback: true,
            ..Self::new(epoch)
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }
}

/// What to do with an incoming worker callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Record it under this state and run the transition function.
    Record(State),
    /// Expected race; log and drop.
    Ignore(&'static str),
    /// The task cannot legitimately receive this response.
    Illegal(String),
}

/// Decide how a worker callback applies to `task`.
pub fn classify(task: &Task, callback: &Callback) -> Verdict {
    if callback.epoch != task.epoch() {
        return Verdict::Ignore("callback belongs to another rollback epoch");
    }

    let state = task.state;
    if callback.rollback {
        return match state {
            State::Rollingback => Verdict::Record(State::Rollingback),
            State::RollbackRequested => Verdict::Record(State::Rollingback),
            State::StopRequested | State::Stopping | State::Stopped => {
                Verdict::Ignore("rollback response after a forced stop")
            }
            _ if task.controller_mode == Mode::Cancel => {
                Verdict::Ignore("rollback response after cancellation")
            }
            _ => Verdict::Illegal(format!("{} is not awaiting a rollback response", state)),
        };
    }

    match state {
        State::Up | State::Stopping => Verdict::Record(state),
        State::Starting | State::StopRequested => match state.awaiting_successor() {
            Some(next) => Verdict::Record(next),
            None => Verdict::Illegal(format!("{state} has no successor")),
        },
        _ if matches!(
            state.group(),
            StateGroup::RollbackTodo | StateGroup::Rollback
        ) || task.rollback_meta.to_rollback =>
        {
            Verdict::Ignore("response after the task was put to rollback")
        }
        State::Stopped if task.stop_flag == StopFlag::Cancelled => {
            Verdict::Ignore("response after the task was cancelled")
        }
        _ => Verdict::Illegal(format!("{state} is not awaiting a response")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn task_in(state: State) -> Task {
        let mut task = Task::new("t");
        task.state = state;
        task
    }

    #[rstest]
    #[case(State::Up, Verdict::Record(State::Up))]
    #[case(State::Starting, Verdict::Record(State::Up))]
    #[case(State::StopRequested, Verdict::Record(State::Stopping))]
    #[case(State::Stopping, Verdict::Record(State::Stopping))]
    #[case(State::ToRollback, Verdict::Ignore("response after the task was put to rollback"))]
    fn normal_callbacks(#[case] state: State, #[case] expected: Verdict) {
        assert_eq!(classify(&task_in(state), &Callback::new(0)), expected);
    }

    #[test]
    fn duplicate_accept_on_final_task_is_illegal() {
        let verdict = classify(&task_in(State::Successful), &Callback::new(0));
        assert!(matches!(verdict, Verdict::Illegal(_)));
    }

    #[test]
    fn stale_epoch_is_ignored() {
        let mut task = task_in(State::Up);
        task.rollback_meta.rollback_counter = 2;
        assert!(matches!(
            classify(&task, &Callback::new(1)),
            Verdict::Ignore(_)
        ));
    }

    #[test]
    fn rollback_response_after_forced_stop_is_ignored() {
        let verdict = classify(&task_in(State::Stopped), &Callback::rollback(0));
        assert!(matches!(verdict, Verdict::Ignore(_)));
    }

    #[test]
    fn late_response_after_cancel_is_ignored() {
        let mut task = task_in(State::Stopped);
        task.stop_flag = StopFlag::Cancelled;
        assert!(matches!(
            classify(&task, &Callback::new(0)),
            Verdict::Ignore(_)
        ));
    }

    #[test]
    fn rollback_callback_is_filed_under_rollingback() {
        let verdict = classify(&task_in(State::RollbackRequested), &Callback::rollback(0));
        assert_eq!(verdict, Verdict::Record(State::Rollingback));
    }
}
