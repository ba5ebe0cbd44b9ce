//! JobQueue port - キューブローカーからのジョブ受信
//!
//! # 実装
//! - **InMemoryJobQueue**: 開発・テスト用（lock 更新と stalled 検知つき）

use async_trait::async_trait;

use crate::domain::{Job, WorkerError};

/// Acknowledgment handed back to the broker.
///
/// - `Ok(Some(value))` / `Ok(None)`: done, with or without a result
/// - `Err(message)`: done with failure
pub type JobResult = Result<Option<serde_json::Value>, String>;

/// A delivered job the worker owns until it calls `done`.
///
/// `done` consumes the lease, so a job can be acknowledged at most once.
#[async_trait]
pub trait JobLease: Send {
    fn job(&self) -> &Job;

    async fn done(self: Box<Self>, result: JobResult) -> Result<(), WorkerError>;
}

/// Queue consumer port.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Wait for the next job of `job_type`.
    ///
    /// Returns `None` when the queue has been closed.
    async fn next(&self, job_type: &str) -> Option<Box<dyn JobLease>>;
}
