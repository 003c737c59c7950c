//! Remote worker / caller notifier ports.
//!
//! どちらも fire-and-report。remote worker の完了は戻り値ではなく
//! `Controller::accept` / `Controller::fail` へのコールバックで届く。
//! ここでの `Err` は「呼び出し自体が失敗した」（retry を使い切った後）を意味する。

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Task, Transition};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("rejected by remote: {0}")]
    Rejected(String),

    #[error("task {0} has no endpoint for this call")]
    MissingEndpoint(String),
}

/// The worker that actually runs tasks.
#[async_trait]
pub trait RemoteWorker: Send + Sync {
    async fn start(&self, task: &Task) -> Result<(), RemoteError>;

    async fn stop(&self, task: &Task) -> Result<(), RemoteError>;

    /// Undo whatever `start` did. Only called for tasks with a rollback
    /// endpoint.
    async fn rollback(&self, task: &Task) -> Result<(), RemoteError>;
}

/// Best-effort transition notifications to whoever submitted the graph.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, transition: Transition, task: &Task) -> Result<(), RemoteError>;
}

#[async_trait]
impl<T: RemoteWorker + ?Sized> RemoteWorker for Arc<T> {
    async fn start(&self, task: &Task) -> Result<(), RemoteError> {
        (**self).start(task).await
    }

    async fn stop(&self, task: &Task) -> Result<(), RemoteError> {
        (**self).stop(task).await
    }

    async fn rollback(&self, task: &Task) -> Result<(), RemoteError> {
        (**self).rollback(task).await
    }
}

#[async_trait]
impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    async fn notify(&self, transition: Transition, task: &Task) -> Result<(), RemoteError> {
        (**self).notify(transition, task).await
    }
}
