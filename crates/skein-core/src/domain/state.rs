//! State - タスクの状態とグループ
//!
//! Every [`State`] belongs to exactly one [`StateGroup`]. Groups drive most of
//! the side effects (queue slots, disposal, rollback waiting), so the mapping
//! lives here and nowhere else.

use std::fmt;

use serde::{Deserialize, Serialize};

/// StateGroup は状態の大分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateGroup {
    /// まだキューに入っていない
    Idle,
    /// キュー待ち（running slot の空き待ち）
    Queued,
    /// remote worker が仕事をしている（queue slot を消費する）
    Running,
    /// 終端
    Final,
    /// rollback を待っている
    RollbackTodo,
    /// rollback 実行中
    Rollback,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    New,
    Waiting,
    Enqueued,
    Starting,
    Up,
    StopRequested,
    Stopping,
    Successful,
    Failed,
    StartFailed,
    StopFailed,
    Stopped,
    RollbackFailed,
    RollbackTriggered,
    ToRollback,
    RollbackRequested,
    Rollingback,
    Rolledback,
}

impl State {
    pub const ALL: [State; 18] = [
        State::New,
        State::Waiting,
        State::Enqueued,
        State::Starting,
        State::Up,
        State::StopRequested,
        State::Stopping,
        State::Successful,
        State::Failed,
        State::StartFailed,
        State::StopFailed,
        State::Stopped,
        State::RollbackFailed,
        State::RollbackTriggered,
        State::ToRollback,
        State::RollbackRequested,
        State::Rollingback,
        State::Rolledback,
    ];

    pub fn group(self) -> StateGroup {
        match self {
            State::New | State::Waiting => StateGroup::Idle,
            State::Enqueued => StateGroup::Queued,
            State::Starting | State::Up | State::StopRequested | State::Stopping => {
                StateGroup::Running
            }
            State::Successful
            | State::Failed
            | State::StartFailed
            | State::StopFailed
            | State::Stopped
            | State::RollbackFailed => StateGroup::Final,
            State::RollbackTriggered | State::ToRollback => StateGroup::RollbackTodo,
            State::RollbackRequested | State::Rollingback | State::Rolledback => {
                StateGroup::Rollback
            }
        }
    }

    pub fn is_final(self) -> bool {
        self.group() == StateGroup::Final
    }

    /// Final and not successful.
    pub fn is_failed_final(self) -> bool {
        self.is_final() && self != State::Successful
    }

    /// A task in these states is already part of a rollback wave.
    pub fn is_mid_rollback(self) -> bool {
        matches!(self, State::ToRollback) || self.group() == StateGroup::Rollback
    }

    /// The state an early remote callback should be filed under when it
    /// overtakes the invocation acknowledgement.
    pub fn awaiting_successor(self) -> Option<State> {
        match self {
            State::Starting => Some(State::Up),
            State::StopRequested => Some(State::Stopping),
            State::RollbackRequested => Some(State::Rollingback),
            _ => None,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::New => "NEW",
            State::Waiting => "WAITING",
            State::Enqueued => "ENQUEUED",
            State::Starting => "STARTING",
            State::Up => "UP",
            State::StopRequested => "STOP_REQUESTED",
            State::Stopping => "STOPPING",
            State::Successful => "SUCCESSFUL",
            State::Failed => "FAILED",
            State::StartFailed => "START_FAILED",
            State::StopFailed => "STOP_FAILED",
            State::Stopped => "STOPPED",
            State::RollbackFailed => "ROLLBACK_FAILED",
            State::RollbackTriggered => "ROLLBACK_TRIGGERED",
            State::ToRollback => "TO_ROLLBACK",
            State::RollbackRequested => "ROLLBACK_REQUESTED",
            State::Rollingback => "ROLLINGBACK",
            State::Rolledback => "ROLLEDBACK",
        };
        f.write_str(s)
    }
}

/// Mode は caller の意図
///
/// - `Idle`: 何もしない（インストール直後のデフォルト）
/// - `Active`: 進めてよい
/// - `Cancel`: 止めてほしい
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    #[default]
    Idle,
    Active,
    Cancel,
}

/// Why a task is stopping. The originating task is recorded separately in
/// `Task::stopped_cause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopFlag {
    #[default]
    None,
    Cancelled,
    DependencyFailed,
    DependencyNotifyFailed,
    Unsuccessful,
}

impl StopFlag {
    pub fn is_set(self) -> bool {
        self != StopFlag::None
    }

    /// Flags whose cause is some other task's failure.
    pub fn is_caused_by_failure(self) -> bool {
        matches!(
            self,
            StopFlag::DependencyFailed | StopFlag::DependencyNotifyFailed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(State::New, StateGroup::Idle)]
    #[case(State::Waiting, StateGroup::Idle)]
    #[case(State::Enqueued, StateGroup::Queued)]
    #[case(State::Starting, StateGroup::Running)]
    #[case(State::Stopping, StateGroup::Running)]
    #[case(State::StopFailed, StateGroup::Final)]
    #[case(State::RollbackFailed, StateGroup::Final)]
    #[case(State::RollbackTriggered, StateGroup::RollbackTodo)]
    #[case(State::ToRollback, StateGroup::RollbackTodo)]
    #[case(State::Rollingback, StateGroup::Rollback)]
    fn states_map_to_groups(#[case] state: State, #[case] group: StateGroup) {
        assert_eq!(state.group(), group);
    }

    #[test]
    fn only_call_states_have_a_successor() {
        let with_successor: Vec<State> = State::ALL
            .into_iter()
            .filter(|s| s.awaiting_successor().is_some())
            .collect();
        assert_eq!(
            with_successor,
            vec![State::Starting, State::StopRequested, State::RollbackRequested]
        );
    }

    #[test]
    fn successful_is_final_but_not_failed() {
        assert!(State::Successful.is_final());
        assert!(!State::Successful.is_failed_final());
        assert!(State::StartFailed.is_failed_final());
    }

    #[test]
    fn display_uses_wire_names() {
        assert_eq!(State::StopRequested.to_string(), "STOP_REQUESTED");
        let json = serde_json::to_string(&State::RollbackTriggered).unwrap();
        assert_eq!(json, "\"ROLLBACK_TRIGGERED\"");
    }
}
