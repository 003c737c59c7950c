//! Transport-boundary retry decorators.
//!
//! The engine itself never retries a remote call. Wrapping a worker or
//! notifier in these gives bounded backoff; only the last error reaches the
//! engine.

use std::future::Future;

use async_trait::async_trait;

use crate::domain::{Task, Transition};
use crate::jobs::RetryPolicy;
use crate::ports::{Notifier, RemoteError, RemoteWorker};

async fn with_retry<F, Fut>(policy: &RetryPolicy, what: &str, mut call: F) -> Result<(), RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), RemoteError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match call().await {
            Ok(()) => return Ok(()),
            // rejection is an answer, not a transport hiccup
            Err(e @ RemoteError::Rejected(_)) | Err(e @ RemoteError::MissingEndpoint(_)) => {
                return Err(e);
            }
            Err(e) if policy.allows(attempts) => {
                let delay = policy.next_delay(attempts);
                tracing::debug!(call = what, attempts, ?delay, error = %e, "retrying remote call");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct RetryingWorker<W> {
    inner: W,
    policy: RetryPolicy,
}

impl<W> RetryingWorker<W> {
    pub fn new(inner: W, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<W: RemoteWorker> RemoteWorker for RetryingWorker<W> {
    async fn start(&self, task: &Task) -> Result<(), RemoteError> {
        with_retry(&self.policy, "start", || self.inner.start(task)).await
    }

    async fn stop(&self, task: &Task) -> Result<(), RemoteError> {
        with_retry(&self.policy, "stop", || self.inner.stop(task)).await
    }

    async fn rollback(&self, task: &Task) -> Result<(), RemoteError> {
        with_retry(&self.policy, "rollback", || self.inner.rollback(task)).await
    }
}

pub struct RetryingNotifier<N> {
    inner: N,
    policy: RetryPolicy,
}

impl<N> RetryingNotifier<N> {
    pub fn new(inner: N, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<N: Notifier> Notifier for RetryingNotifier<N> {
    async fn notify(&self, transition: Transition, task: &Task) -> Result<(), RemoteError> {
        with_retry(&self.policy, "notify", || self.inner.notify(transition, task)).await
    }
}

/// Notifier for deployments without caller notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _transition: Transition, _task: &Task) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Notifier for Flaky {
        async fn notify(&self, _t: Transition, _task: &Task) -> Result<(), RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(RemoteError::Transport("connection reset".into()));
            }
            Ok(())
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let notifier = RetryingNotifier::new(Flaky::new(2), policy(3));
        let task = Task::new("a");
        notifier
            .notify(Transition::NewToEnqueued, &task)
            .await
            .unwrap();
        assert_eq!(notifier.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_the_last_error() {
        let notifier = RetryingNotifier::new(Flaky::new(5), policy(2));
        let task = Task::new("a");
        let err = notifier
            .notify(Transition::NewToEnqueued, &task)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)));
        assert_eq!(notifier.inner.calls.load(Ordering::SeqCst), 2);
    }
}
