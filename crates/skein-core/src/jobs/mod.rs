//! Jobs - 遷移から生まれる副作用
//!
//! A job is a deferred side effect with a declared transactional phase:
//!
//! - `InProgress`: runs immediately inside the transaction that produced it
//! - `AfterSuccess`: runs only once that transaction committed, without a
//!   transaction of its own (wrap it in a [`Delegate`] to get one)
//!
//! Composition lives next to it: [`JobChain`] (sequential, gated on the
//! previous outcome), [`JobTree`] (BFS over success / failure / always
//! edges) and [`Delegate`] (new-or-joined transaction plus retry).

mod chain;
mod delegate;
pub mod lifecycle;
mod retry;
mod tree;

use std::fmt;

use async_trait::async_trait;

pub use chain::JobChain;
pub use delegate::{Delegate, TxMode};
pub use retry::RetryPolicy;
pub use tree::{JobTree, NodeId};

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::store::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    InProgress,
    AfterSuccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl<T> From<&Result<T>> for Outcome {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(_) => Outcome::Failure,
        }
    }
}

/// Which outcome of the previous job lets the next one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Always,
    OnSuccess,
    OnFailure,
}

impl Trigger {
    pub fn matches(self, outcome: Outcome) -> bool {
        match self {
            Trigger::Always => true,
            Trigger::OnSuccess => outcome == Outcome::Success,
            Trigger::OnFailure => outcome == Outcome::Failure,
        }
    }
}

/// A deferred side effect.
///
/// `run` gets the transaction it must act in when it has one: the
/// originating transaction for `InProgress` jobs, the delegate's own for
/// wrapped jobs, `None` for bare after-commit jobs.
#[async_trait]
pub trait Job: Send + Sync + fmt::Debug {
    fn phase(&self) -> TransactionPhase;

    /// Run on the worker pool instead of inline after commit.
    fn is_async(&self) -> bool {
        false
    }

    /// Task this job acts for, for logging.
    fn task(&self) -> Option<&str> {
        None
    }

    fn name(&self) -> &'static str;

    async fn run(&self, engine: &Engine, tx: Option<&mut Transaction>) -> Result<()>;
}

/// Unwrap the transaction a job needs.
pub(crate) fn require_tx<'a>(
    tx: Option<&'a mut Transaction>,
    job: &dyn Job,
) -> Result<&'a mut Transaction> {
    tx.ok_or_else(|| {
        EngineError::Internal(format!(
            "job {} needs a transaction but ran without one",
            job.name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Trigger::Always, Outcome::Success, true)]
    #[case(Trigger::Always, Outcome::Failure, true)]
    #[case(Trigger::OnSuccess, Outcome::Success, true)]
    #[case(Trigger::OnSuccess, Outcome::Failure, false)]
    #[case(Trigger::OnFailure, Outcome::Success, false)]
    #[case(Trigger::OnFailure, Outcome::Failure, true)]
    fn triggers_match_outcomes(
        #[case] trigger: Trigger,
        #[case] outcome: Outcome,
        #[case] expected: bool,
    ) {
        assert_eq!(trigger.matches(outcome), expected);
    }
}
