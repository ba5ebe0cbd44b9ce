//! InMemoryStateStore - 開発・テスト用の協調ストア
//!
//! # 実装詳細
//! - 呼び出しをすべて `StoreCall` として記録（テストで順序や回数を検証する）
//! - タスク状態は `(JobId, TaskId)` ごとに最新のものを保持
//! - watch は job ごとに mpsc sender を保持し、`stop_job()` で通知を流す
//! - `fail_*` で障害を注入できる（best-effort の検証用）
//! - `yield_before_calls(true)` で各呼び出しの前に一度 yield する（並行登録の再現用）
//!
//! # 使用例
//! ```ignore
//! let store = InMemoryStateStore::new();
//! let mut watch = store.watch_job(&job_id).await?;
//! store.stop_job(&job_id, json!({"state": "stop"}));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::domain::{
    DiscoveryKey, DiscoveryRecord, JobEvent, JobId, TaskId, TaskStateUpdate, WorkerError,
};
use crate::ports::{JobWatch, StateStore};

/// One recorded store call.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Watch(JobId),
    Unwatch(JobId),
    SetState(TaskStateUpdate),
    RegisterDiscovery(DiscoveryRecord),
    UpdateDiscovery(DiscoveryRecord),
}

#[derive(Default)]
struct Faults {
    watch: bool,
    unwatch: bool,
    set_task_state: bool,
    discovery: bool,
}

#[derive(Default)]
struct StoreState {
    calls: Vec<StoreCall>,
    tasks: HashMap<(JobId, TaskId), TaskStateUpdate>,
    discovery: HashMap<DiscoveryKey, DiscoveryRecord>,
    watchers: HashMap<JobId, mpsc::UnboundedSender<JobEvent>>,
    faults: Faults,
}

pub struct InMemoryStateStore {
    state: Mutex<StoreState>,
    yielding: AtomicBool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            yielding: AtomicBool::new(false),
        }
    }

    /// Deliver a change notification to the job's watcher.
    ///
    /// Returns `false` when nobody is watching the job.
    pub fn stop_job(&self, job_id: &JobId, payload: serde_json::Value) -> bool {
        let state = self.state.lock();
        match state.watchers.get(job_id) {
            Some(tx) => tx.send(JobEvent::new(job_id.clone(), payload)).is_ok(),
            None => false,
        }
    }

    pub fn is_watching(&self, job_id: &JobId) -> bool {
        self.state.lock().watchers.contains_key(job_id)
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    /// Every task-state write for a job, oldest first.
    pub fn task_updates(&self, job_id: &JobId) -> Vec<TaskStateUpdate> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                StoreCall::SetState(update) if &update.job_id == job_id => Some(update.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn task_state(&self, job_id: &JobId, task_id: &TaskId) -> Option<TaskStateUpdate> {
        self.state
            .lock()
            .tasks
            .get(&(job_id.clone(), task_id.clone()))
            .cloned()
    }

    pub fn discovery(&self, key: &DiscoveryKey) -> Option<DiscoveryRecord> {
        self.state.lock().discovery.get(key).cloned()
    }

    pub fn fail_watch(&self, fail: bool) {
        self.state.lock().faults.watch = fail;
    }

    pub fn fail_unwatch(&self, fail: bool) {
        self.state.lock().faults.unwatch = fail;
    }

    pub fn fail_set_task_state(&self, fail: bool) {
        self.state.lock().faults.set_task_state = fail;
    }

    pub fn fail_discovery(&self, fail: bool) {
        self.state.lock().faults.discovery = fail;
    }

    /// Make every call suspend once before touching the store, like a remote round trip.
    pub fn yield_before_calls(&self, enabled: bool) {
        self.yielding.store(enabled, Ordering::SeqCst);
    }

    async fn round_trip(&self) {
        if self.yielding.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn injected(operation: &str) -> WorkerError {
    WorkerError::BackendUnavailable(format!("injected {operation} failure"))
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn set_task_state(&self, update: &TaskStateUpdate) -> Result<(), WorkerError> {
        self.round_trip().await;
        let mut state = self.state.lock();
        state.calls.push(StoreCall::SetState(update.clone()));
        if state.faults.set_task_state {
            return Err(injected("set_task_state"));
        }
        state.tasks.insert(
            (update.job_id.clone(), update.task_id.clone()),
            update.clone(),
        );
        Ok(())
    }

    async fn register_discovery(
        &self,
        key: &DiscoveryKey,
        record: &DiscoveryRecord,
    ) -> Result<(), WorkerError> {
        self.round_trip().await;
        let mut state = self.state.lock();
        state.calls.push(StoreCall::RegisterDiscovery(record.clone()));
        if state.faults.discovery {
            return Err(injected("register_discovery"));
        }
        state.discovery.insert(key.clone(), record.clone());
        Ok(())
    }

    async fn update_discovery(
        &self,
        key: &DiscoveryKey,
        record: &DiscoveryRecord,
    ) -> Result<(), WorkerError> {
        self.round_trip().await;
        let mut state = self.state.lock();
        state.calls.push(StoreCall::UpdateDiscovery(record.clone()));
        if state.faults.discovery {
            return Err(injected("update_discovery"));
        }
        state.discovery.insert(key.clone(), record.clone());
        Ok(())
    }

    async fn watch_job(&self, job_id: &JobId) -> Result<JobWatch, WorkerError> {
        self.round_trip().await;
        let mut state = self.state.lock();
        state.calls.push(StoreCall::Watch(job_id.clone()));
        if state.faults.watch {
            return Err(injected("watch_job"));
        }
        let (tx, watch) = JobWatch::channel();
        state.watchers.insert(job_id.clone(), tx);
        Ok(watch)
    }

    async fn unwatch_job(&self, job_id: &JobId) -> Result<(), WorkerError> {
        self.round_trip().await;
        let mut state = self.state.lock();
        state.calls.push(StoreCall::Unwatch(job_id.clone()));
        if state.faults.unwatch {
            return Err(injected("unwatch_job"));
        }
        // dropping the sender ends the watch stream
        state.watchers.remove(job_id);
        Ok(())
    }
}
