//! Errors - エラー型と分類
//!
//! ジョブ単位のエラー（sandbox の失敗、store への書き込み失敗）は
//! lifecycle の中で terminal status に変換され、外へは漏れません。

use thiserror::Error;

use super::ids::JobId;
use super::state::JobState;

/// Caller-supplied code threw, rejected, or was cut off.
///
/// `Display` is the bare message so it can be stored as the task's error text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    /// Store or broker call failed (network, timeout, bad response).
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("job {0} is already resolved")]
    DuplicateCompletion(JobId),

    #[error("invalid job state transition {from:?} -> {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("invalid job payload: {0}")]
    InvalidJob(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl WorkerError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        WorkerError::BackendUnavailable(err.to_string())
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(err: reqwest::Error) -> Self {
        WorkerError::BackendUnavailable(err.to_string())
    }
}
