//! Engine errors.
//!
//! # 分類
//! - Validation: バッチが壊れている（何も保存されない）
//! - Conflict: 名前・constraint の衝突、循環、milestone 不到達
//! - Concurrency: CAS の version 不一致（呼び出し側がやり直す）
//! - IllegalState: 状態に合わない操作
//! - Infrastructure: store / remote の障害
//! - Internal: engine 自身のバグ

use thiserror::Error;

use crate::domain::State;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Concurrency,
    IllegalState,
    Infrastructure,
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("task {name} already exists")]
    TaskConflict { name: String },

    #[error("constraint {constraint} is held by task {holder}")]
    ConstraintConflict { constraint: String, holder: String },

    #[error("cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("milestone {milestone} cannot restart task {task}")]
    MilestoneUnreachable { task: String, milestone: String },

    #[error("concurrent update of {key}")]
    ConcurrentUpdate { key: String },

    #[error("task {task} in state {state}: {reason}")]
    IllegalState {
        task: String,
        state: State,
        reason: String,
    },

    #[error("task {name} not found")]
    TaskNotFound { name: String },

    #[error("remote call failed: {0}")]
    Remote(#[from] crate::ports::RemoteError),

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::TaskConflict { .. }
            | EngineError::ConstraintConflict { .. }
            | EngineError::CycleDetected { .. }
            | EngineError::MilestoneUnreachable { .. } => ErrorKind::Conflict,
            EngineError::ConcurrentUpdate { .. } => ErrorKind::Concurrency,
            EngineError::IllegalState { .. } | EngineError::TaskNotFound { .. } => {
                ErrorKind::IllegalState
            }
            EngineError::Remote(_) | EngineError::Storage { .. } => ErrorKind::Infrastructure,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only version conflicts are worth retrying from a fresh read.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Concurrency
    }

    pub fn concurrent(key: impl Into<String>) -> Self {
        EngineError::ConcurrentUpdate { key: key.into() }
    }

    pub fn illegal(task: &str, state: State, reason: impl Into<String>) -> Self {
        EngineError::IllegalState {
            task: task.to_string(),
            state,
            reason: reason.into(),
        }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        EngineError::TaskNotFound { name: name.into() }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        EngineError::Storage {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_concurrency_is_retryable() {
        assert!(EngineError::concurrent("task:a").is_retryable());
        assert!(!EngineError::Validation("x".into()).is_retryable());
        assert!(!EngineError::not_found("a").is_retryable());
    }

    #[test]
    fn cycle_message_lists_the_path() {
        let err = EngineError::CycleDetected {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cycle detected: a -> b -> a");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn unreachable_milestone_is_a_conflict() {
        let err = EngineError::MilestoneUnreachable {
            task: "b".into(),
            milestone: "a".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retryable());
    }
}
