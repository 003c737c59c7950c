//! Delegate - 別トランザクションとリトライを付与するラッパー
//!
//! A wrapped job either joins the caller's transaction or gets one of its
//! own. With its own transaction a lost CAS race (`ConcurrentUpdate`) is
//! retried from scratch under the configured policy; inside a joined
//! transaction a retry would be meaningless, so the error propagates.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Job, RetryPolicy, TransactionPhase};
use crate::engine::Engine;
use crate::error::Result;
use crate::store::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Use the caller's transaction; start one only if there is none.
    Join,
    RequiresNew,
}

#[derive(Debug)]
pub struct Delegate {
    inner: Arc<dyn Job>,
    tx_mode: TxMode,
    retry: RetryPolicy,
    phase: TransactionPhase,
    asynchronous: bool,
}

impl Delegate {
    pub fn new(inner: Arc<dyn Job>) -> Self {
        Self {
            phase: inner.phase(),
            asynchronous: inner.is_async(),
            inner,
            tx_mode: TxMode::Join,
            retry: RetryPolicy::once(),
        }
    }

    pub fn in_new_transaction(mut self) -> Self {
        self.tx_mode = TxMode::RequiresNew;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Run only after the originating transaction committed, inline or on
    /// the worker pool.
    pub fn after_commit(mut self, asynchronous: bool) -> Self {
        self.phase = TransactionPhase::AfterSuccess;
        self.asynchronous = asynchronous;
        self
    }

    pub fn into_job(self) -> Arc<dyn Job> {
        Arc::new(self)
    }
}

#[async_trait]
impl Job for Delegate {
    fn phase(&self) -> TransactionPhase {
        self.phase
    }

    fn is_async(&self) -> bool {
        self.asynchronous
    }

    fn task(&self) -> Option<&str> {
        self.inner.task()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn run(&self, engine: &Engine, mut tx: Option<&mut Transaction>) -> Result<()> {
        let joined = self.tx_mode == TxMode::Join && tx.is_some();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = if joined {
                self.inner.run(engine, tx.as_deref_mut()).await
            } else {
                engine.run_in_new_transaction(self.inner.as_ref()).await
            };
            match result {
                Err(e) if !joined && e.is_retryable() && self.retry.allows(attempts) => {
                    let delay = self.retry.next_delay(attempts);
                    tracing::debug!(
                        job = self.inner.name(),
                        task = self.inner.task(),
                        attempts,
                        ?delay,
                        "transaction lost a race, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
