//! Transition - 状態遷移の表と純粋な遷移関数
//!
//! `next` looks at one task and answers "what is the next edge of the state
//! machine, if any". It never touches the store and never emits side effects;
//! the controller applies the returned [`Transition`] and maps it to jobs.
//!
//! # Design note
//! The function is a nested `match` over the state, so adding a state without
//! deciding its exits does not compile.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{Mode, State, StopFlag};
use super::task::{Task, TransitionTime};

macro_rules! transitions {
    ($($variant:ident: $from:ident => $to:ident,)*) => {
        /// An edge of the task state machine.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum Transition {
            $($variant,)*
        }

        impl Transition {
            pub const ALL: &'static [Transition] = &[$(Transition::$variant,)*];

            pub fn from(self) -> State {
                match self {
                    $(Transition::$variant => State::$from,)*
                }
            }

            pub fn to(self) -> State {
                match self {
                    $(Transition::$variant => State::$to,)*
                }
            }
        }
    };
}

transitions! {
    NewToWaiting: New => Waiting,
    NewToEnqueued: New => Enqueued,
    NewToStopped: New => Stopped,
    NewToRolledback: New => Rolledback,
    WaitingToEnqueued: Waiting => Enqueued,
    WaitingToStopped: Waiting => Stopped,
    WaitingToRolledback: Waiting => Rolledback,
    EnqueuedToStarting: Enqueued => Starting,
    EnqueuedToStopped: Enqueued => Stopped,
    EnqueuedToRolledback: Enqueued => Rolledback,
    StartingToUp: Starting => Up,
    StartingToStartFailed: Starting => StartFailed,
    StartingToRollbackTriggered: Starting => RollbackTriggered,
    UpToSuccessful: Up => Successful,
    UpToFailed: Up => Failed,
    UpToStopRequested: Up => StopRequested,
    UpToRollbackTriggered: Up => RollbackTriggered,
    UpToToRollback: Up => ToRollback,
    StopRequestedToStopping: StopRequested => Stopping,
    StopRequestedToStopFailed: StopRequested => StopFailed,
    StoppingToStopped: Stopping => Stopped,
    StoppingToStopFailed: Stopping => StopFailed,
    SuccessfulToToRollback: Successful => ToRollback,
    FailedToToRollback: Failed => ToRollback,
    StartFailedToToRollback: StartFailed => ToRollback,
    StopFailedToToRollback: StopFailed => ToRollback,
    StoppedToToRollback: Stopped => ToRollback,
    RollbackTriggeredToRollbackRequested: RollbackTriggered => RollbackRequested,
    RollbackTriggeredToRolledback: RollbackTriggered => Rolledback,
    RollbackTriggeredToFailed: RollbackTriggered => Failed,
    ToRollbackToRollbackRequested: ToRollback => RollbackRequested,
    ToRollbackToRolledback: ToRollback => Rolledback,
    RollbackRequestedToRollingback: RollbackRequested => Rollingback,
    RollbackRequestedToRollbackFailed: RollbackRequested => RollbackFailed,
    RollingbackToRolledback: Rollingback => Rolledback,
    RollingbackToRollbackFailed: Rollingback => RollbackFailed,
    RolledbackToNew: Rolledback => New,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from(), self.to())
    }
}

/// Polarity of the engine-side response (invocation result or timeout) for
/// `state` in the current epoch.
fn engine_response(task: &Task, state: State) -> Option<bool> {
    let epoch = task.epoch();
    task.server_responses
        .iter()
        .rev()
        .find(|r| r.state == state && r.rollback_counter == epoch && r.origin.is_engine())
        .map(|r| r.positive)
}

fn any_response(task: &Task, state: State) -> Option<bool> {
    task.latest_response(state).map(|r| r.positive)
}

/// Compute the next transition of `task`, or `None` when it has to wait.
pub fn next(task: &Task) -> Option<Transition> {
    use Transition::*;

    let meta = &task.rollback_meta;
    let rollback_ready = meta.to_rollback && meta.unrestored_dependants <= 0;
    let active = task.controller_mode == Mode::Active;
    let stopping = task.controller_mode == Mode::Cancel || task.stop_flag.is_set();
    let deps_done = task.unfinished_dependencies <= 0;

    match task.state {
        State::New | State::Waiting | State::Enqueued if meta.to_rollback => {
            if !rollback_ready {
                return None;
            }
            match task.state {
                State::New => Some(NewToRolledback),
                State::Waiting => Some(WaitingToRolledback),
                _ => Some(EnqueuedToRolledback),
            }
        }
        State::New | State::Waiting | State::Enqueued if stopping => match task.state {
            State::New => Some(NewToStopped),
            State::Waiting => Some(WaitingToStopped),
            _ => Some(EnqueuedToStopped),
        },
        State::New if active => Some(if deps_done { NewToEnqueued } else { NewToWaiting }),
        State::New => None,
        State::Waiting => (active && deps_done).then_some(WaitingToEnqueued),
        State::Enqueued => task.starting.then_some(EnqueuedToStarting),

        State::Starting => match engine_response(task, State::Starting)? {
            true => Some(StartingToUp),
            false if task.can_trigger_rollback() => Some(StartingToRollbackTriggered),
            false => Some(StartingToStartFailed),
        },
        State::Up => match any_response(task, State::Up) {
            Some(_) if meta.to_rollback => Some(UpToToRollback),
            Some(true) => Some(UpToSuccessful),
            Some(false) if task.can_trigger_rollback() => Some(UpToRollbackTriggered),
            Some(false) => Some(UpToFailed),
            None if task.controller_mode == Mode::Cancel => Some(UpToStopRequested),
            None => None,
        },
        State::StopRequested => match engine_response(task, State::StopRequested)? {
            true => Some(StopRequestedToStopping),
            false => Some(StopRequestedToStopFailed),
        },
        State::Stopping => match any_response(task, State::Stopping)? {
            true => Some(StoppingToStopped),
            false => Some(StoppingToStopFailed),
        },

        State::Successful => meta.to_rollback.then_some(SuccessfulToToRollback),
        State::Failed => meta.to_rollback.then_some(FailedToToRollback),
        State::StartFailed => meta.to_rollback.then_some(StartFailedToToRollback),
        State::StopFailed => meta.to_rollback.then_some(StopFailedToToRollback),
        State::Stopped => meta.to_rollback.then_some(StoppedToToRollback),
        State::RollbackFailed => None,

        State::RollbackTriggered if rollback_ready => Some(if meta.skip_remote_rollback {
            RollbackTriggeredToRolledback
        } else {
            RollbackTriggeredToRollbackRequested
        }),
        State::RollbackTriggered => (!meta.to_rollback
            && task.controller_mode == Mode::Cancel)
            .then_some(RollbackTriggeredToFailed),
        State::ToRollback => rollback_ready.then_some(if meta.skip_remote_rollback {
            ToRollbackToRolledback
        } else {
            ToRollbackToRollbackRequested
        }),
        State::RollbackRequested => match engine_response(task, State::RollbackRequested)? {
            true => Some(RollbackRequestedToRollingback),
            false => Some(RollbackRequestedToRollbackFailed),
        },
        State::Rollingback => match any_response(task, State::Rollingback)? {
            true => Some(RollingbackToRolledback),
            false => Some(RollingbackToRollbackFailed),
        },
        State::Rolledback => Some(RolledbackToNew),
    }
}

/// Apply `transition` to `task` in memory, including the bookkeeping that
/// belongs to the edge itself.
pub fn apply(task: &mut Task, transition: Transition, at: DateTime<Utc>) {
    debug_assert_eq!(task.state, transition.from());
    let to = transition.to();

    match transition {
        Transition::EnqueuedToStarting => task.starting = false,
        Transition::StartingToRollbackTriggered | Transition::UpToRollbackTriggered => {
            task.rollback_meta.trigger_counter += 1;
        }
        Transition::RolledbackToNew => task.reset_for_replay(),
        _ => {}
    }
    if matches!(
        to,
        State::Failed | State::StartFailed | State::StopFailed | State::RollbackFailed
    ) {
        let name = task.name.clone();
        task.stop_with(StopFlag::Unsuccessful, &name);
    }

    task.state = to;
    task.timestamps.push(TransitionTime { transition, at });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::response::Origin;
    use crate::domain::task::ServerResponse;
    use rstest::rstest;
    use std::collections::HashSet;

    fn task(state: State, mode: Mode) -> Task {
        let mut task = Task::new("t");
        task.state = state;
        task.controller_mode = mode;
        task
    }

    fn respond(task: &mut Task, state: State, positive: bool, origin: Origin) {
        task.server_responses.push(ServerResponse {
            state,
            positive,
            rollback_counter: task.epoch(),
            origin,
            body: serde_json::Value::Null,
        });
    }

    #[test]
    fn transition_table_has_no_duplicate_edges() {
        let edges: HashSet<(State, State)> =
            Transition::ALL.iter().map(|t| (t.from(), t.to())).collect();
        assert_eq!(edges.len(), Transition::ALL.len());
    }

    #[rstest]
    #[case(Mode::Idle, 0, None)]
    #[case(Mode::Active, 0, Some(Transition::NewToEnqueued))]
    #[case(Mode::Active, 2, Some(Transition::NewToWaiting))]
    #[case(Mode::Cancel, 2, Some(Transition::NewToStopped))]
    fn new_task_exits(
        #[case] mode: Mode,
        #[case] unfinished: i32,
        #[case] expected: Option<Transition>,
    ) {
        let mut t = task(State::New, mode);
        t.unfinished_dependencies = unfinished;
        assert_eq!(next(&t), expected);
    }

    #[test]
    fn waiting_task_never_leaves_idle_with_unfinished_dependencies() {
        let mut t = task(State::Waiting, Mode::Active);
        t.unfinished_dependencies = 1;
        assert_eq!(next(&t), None);
        t.unfinished_dependencies = 0;
        assert_eq!(next(&t), Some(Transition::WaitingToEnqueued));
    }

    #[test]
    fn enqueued_waits_for_the_starting_latch() {
        let mut t = task(State::Enqueued, Mode::Active);
        assert_eq!(next(&t), None);
        t.starting = true;
        assert_eq!(next(&t), Some(Transition::EnqueuedToStarting));
    }

    #[test]
    fn starting_only_resolves_on_invocation_result() {
        let mut t = task(State::Starting, Mode::Active);
        respond(&mut t, State::Starting, true, Origin::Remote);
        assert_eq!(next(&t), None);
        respond(&mut t, State::Starting, true, Origin::Invocation);
        assert_eq!(next(&t), Some(Transition::StartingToUp));
    }

    #[rstest]
    #[case(true, false, None, Transition::UpToSuccessful)]
    #[case(false, false, None, Transition::UpToFailed)]
    #[case(false, false, Some("m"), Transition::UpToRollbackTriggered)]
    #[case(true, true, None, Transition::UpToToRollback)]
    #[case(false, true, Some("m"), Transition::UpToToRollback)]
    fn up_resolves_on_remote_response(
        #[case] positive: bool,
        #[case] to_rollback: bool,
        #[case] milestone: Option<&str>,
        #[case] expected: Transition,
    ) {
        let mut t = task(State::Up, Mode::Active);
        t.milestone_task = milestone.map(str::to_string);
        t.rollback_meta.to_rollback = to_rollback;
        respond(&mut t, State::Up, positive, Origin::Remote);
        assert_eq!(next(&t), Some(expected));
    }

    #[test]
    fn exhausted_trigger_budget_falls_back_to_failure() {
        let mut t = task(State::Up, Mode::Active);
        t.milestone_task = Some("m".into());
        t.configuration.rollback_limit = 2;
        t.rollback_meta.trigger_counter = 2;
        respond(&mut t, State::Up, false, Origin::Remote);
        assert_eq!(next(&t), Some(Transition::UpToFailed));
    }

    #[test]
    fn cancel_while_up_requests_stop() {
        let t = task(State::Up, Mode::Cancel);
        assert_eq!(next(&t), Some(Transition::UpToStopRequested));
    }

    #[test]
    fn responses_from_previous_epoch_are_ignored() {
        let mut t = task(State::Up, Mode::Active);
        respond(&mut t, State::Up, true, Origin::Remote);
        t.rollback_meta.rollback_counter = 1;
        assert_eq!(next(&t), None);
    }

    #[rstest]
    #[case(State::Successful, Transition::SuccessfulToToRollback)]
    #[case(State::Stopped, Transition::StoppedToToRollback)]
    #[case(State::StartFailed, Transition::StartFailedToToRollback)]
    fn primed_final_tasks_move_to_rollback(#[case] state: State, #[case] expected: Transition) {
        let mut t = task(state, Mode::Active);
        assert_eq!(next(&t), None);
        t.rollback_meta.to_rollback = true;
        assert_eq!(next(&t), Some(expected));
    }

    #[rstest]
    #[case(0, true, Some(Transition::ToRollbackToRolledback))]
    #[case(0, false, Some(Transition::ToRollbackToRollbackRequested))]
    #[case(1, true, None)]
    fn to_rollback_waits_for_dependants(
        #[case] unrestored: i32,
        #[case] skip_remote: bool,
        #[case] expected: Option<Transition>,
    ) {
        let mut t = task(State::ToRollback, Mode::Active);
        t.rollback_meta.to_rollback = true;
        t.rollback_meta.unrestored_dependants = unrestored;
        t.rollback_meta.skip_remote_rollback = skip_remote;
        assert_eq!(next(&t), expected);
    }

    #[test]
    fn primed_idle_task_rolls_back_only_when_dependants_are_restored() {
        let mut t = task(State::Waiting, Mode::Active);
        t.rollback_meta.to_rollback = true;
        t.rollback_meta.unrestored_dependants = 1;
        assert_eq!(next(&t), None);
        t.rollback_meta.unrestored_dependants = 0;
        assert_eq!(next(&t), Some(Transition::WaitingToRolledback));
    }

    #[test]
    fn apply_resets_the_task_after_rollback() {
        let mut t = task(State::Rolledback, Mode::Active);
        t.rollback_meta.to_rollback = true;
        apply(&mut t, Transition::RolledbackToNew, Utc::now());
        assert_eq!(t.state, State::New);
        assert_eq!(t.epoch(), 1);
        assert_eq!(next(&t), Some(Transition::NewToEnqueued));
    }

    #[test]
    fn apply_marks_failures_unsuccessful() {
        let mut t = task(State::Up, Mode::Active);
        apply(&mut t, Transition::UpToFailed, Utc::now());
        assert_eq!(t.stop_flag, StopFlag::Unsuccessful);
        assert_eq!(t.stopped_cause.as_deref(), Some("t"));
        assert_eq!(t.timestamps.len(), 1);
    }

    #[test]
    fn apply_consumes_the_starting_latch() {
        let mut t = task(State::Enqueued, Mode::Active);
        t.starting = true;
        apply(&mut t, Transition::EnqueuedToStarting, Utc::now());
        assert!(!t.starting);
        assert_eq!(next(&t), None);
    }
}
