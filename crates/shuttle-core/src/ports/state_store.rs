//! StateStore port - 協調ストア（etcd など）への型付きアクセス
//!
//! タスク状態の書き込み、discovery レコード、ジョブ watch の登録・解除を提供します。
//!
//! # 実装
//! - **InMemoryStateStore**: テスト・ローカル実行用
//! - **EtcdStateStore**: etcd v3 JSON gateway

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{DiscoveryKey, DiscoveryRecord, JobEvent, JobId, TaskStateUpdate, WorkerError};

/// Live subscription returned by `watch_job`.
///
/// Events stop arriving once the store side is unwatched or the sender is
/// dropped; the receiver then yields `None`.
pub struct JobWatch {
    events: mpsc::UnboundedReceiver<JobEvent>,
}

impl JobWatch {
    pub fn new(events: mpsc::UnboundedReceiver<JobEvent>) -> Self {
        Self { events }
    }

    /// Paired sender/watch for store implementations.
    pub fn channel() -> (mpsc::UnboundedSender<JobEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }

    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }
}

/// Coordination store as seen by the worker core.
///
/// # 設計原則
/// - すべてのメソッドは失敗しうるリモート呼び出しとして扱う
/// - リトライはしない（クライアント側の責務）
/// - `unwatch_job` は冪等（未登録の job でも Ok）
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn set_task_state(&self, update: &TaskStateUpdate) -> Result<(), WorkerError>;

    async fn register_discovery(
        &self,
        key: &DiscoveryKey,
        record: &DiscoveryRecord,
    ) -> Result<(), WorkerError>;

    async fn update_discovery(
        &self,
        key: &DiscoveryKey,
        record: &DiscoveryRecord,
    ) -> Result<(), WorkerError>;

    /// Resolves only once the subscription is live on the store side.
    async fn watch_job(&self, job_id: &JobId) -> Result<JobWatch, WorkerError>;

    async fn unwatch_job(&self, job_id: &JobId) -> Result<(), WorkerError>;
}
