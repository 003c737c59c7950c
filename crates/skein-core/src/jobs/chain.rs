//! Sequential jobs, each gated on the outcome of the one before.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Job, Outcome, TransactionPhase, Trigger};
use crate::engine::Engine;
use crate::error::Result;
use crate::store::Transaction;

#[derive(Debug)]
pub struct JobChain {
    links: Vec<(Trigger, Arc<dyn Job>)>,
    phase: TransactionPhase,
    asynchronous: bool,
}

impl JobChain {
    /// The chain inherits phase and execution mode from its first job.
    pub fn new(first: Arc<dyn Job>) -> Self {
        Self {
            phase: first.phase(),
            asynchronous: first.is_async(),
            links: vec![(Trigger::Always, first)],
        }
    }

    pub fn then(mut self, trigger: Trigger, job: Arc<dyn Job>) -> Self {
        self.links.push((trigger, job));
        self
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[async_trait]
impl Job for JobChain {
    fn phase(&self) -> TransactionPhase {
        self.phase
    }

    fn is_async(&self) -> bool {
        self.asynchronous
    }

    fn task(&self) -> Option<&str> {
        self.links.first().and_then(|(_, job)| job.task())
    }

    fn name(&self) -> &'static str {
        "job-chain"
    }

    async fn run(&self, engine: &Engine, mut tx: Option<&mut Transaction>) -> Result<()> {
        let mut last: Result<()> = Ok(());
        for (trigger, job) in &self.links {
            if !trigger.matches(Outcome::from(&last)) {
                break;
            }
            last = job.run(engine, tx.as_deref_mut()).await;
            if let Err(e) = &last {
                tracing::debug!(job = job.name(), task = job.task(), error = %e, "chain link failed");
            }
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingJob, test_engine};

    #[tokio::test]
    async fn stops_at_first_unmatched_gate() {
        let (engine, _) = test_engine();
        let first = CountingJob::failing("first");
        let on_success = CountingJob::ok("on-success");
        let on_failure = CountingJob::ok("on-failure");

        let chain = JobChain::new(first.clone())
            .then(Trigger::OnSuccess, on_success.clone())
            .then(Trigger::OnFailure, on_failure.clone());

        assert!(chain.run(&engine, None).await.is_err());
        assert_eq!(first.runs(), 1);
        assert_eq!(on_success.runs(), 0);
        // gate closed at the second link, so the third never ran either
        assert_eq!(on_failure.runs(), 0);
    }

    #[tokio::test]
    async fn runs_all_links_on_success() {
        let (engine, _) = test_engine();
        let a = CountingJob::ok("a");
        let b = CountingJob::ok("b");
        let c = CountingJob::ok("c");

        let chain = JobChain::new(a.clone())
            .then(Trigger::OnSuccess, b.clone())
            .then(Trigger::Always, c.clone());

        chain.run(&engine, None).await.unwrap();
        assert_eq!((a.runs(), b.runs(), c.runs()), (1, 1, 1));
        assert_eq!(chain.len(), 3);
    }
}
