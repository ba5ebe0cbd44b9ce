//! InMemoryJobQueue - 開発・テスト用のキューブローカー
//!
//! # 実装詳細
//! - job type ごとの ready キュー（`HashMap<String, VecDeque<EntryId>>`）
//! - lease 中のジョブは lock を持ち、lease 側のタスクが `lock_duration / 2` ごとに更新する
//! - `check_stalled()` が期限切れの lock を見つけたら再配送する
//!   （`max_stalled_count` を超えたら failed にする）
//! - 再配送時に lease token を進めるので、古い lease の `done` は拒否される
//! - 完了・失敗したエントリは直近 `retention` 件だけ残す（件数は累計で数える）
//!
//! # 使用例
//! ```ignore
//! let queue = Arc::new(InMemoryJobQueue::new(QueueSettings::default()));
//! queue.enqueue("green-alg", job).await?;
//! let lease = queue.next("green-alg").await.unwrap();
//! lease.done(Ok(Some(json!(3)))).await?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::QueueSettings;
use crate::domain::{Job, JobId, WorkerError};
use crate::ports::{JobLease, JobQueue, JobResult};

/// Failure recorded for a job whose lock expired too many times.
pub const STALLED_LIMIT_MESSAGE: &str = "job stalled more than allowable limit";

/// Finished entries kept for `result` lookups by default.
pub const DEFAULT_FINISHED_RETENTION: usize = 1_000;

type EntryId = u64;

#[derive(Debug, Clone, PartialEq)]
enum EntryStatus {
    Waiting,
    Active { token: u64, lock_expires_at: Instant },
    Completed(Option<serde_json::Value>),
    Failed(String),
}

struct QueueEntry {
    job: Job,
    job_type: String,
    status: EntryStatus,
    stalled_count: u32,
}

/// Per-state counts for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

struct QueueState {
    entries: HashMap<EntryId, QueueEntry>,
    ready: HashMap<String, VecDeque<EntryId>>,
    /// Finished entries, oldest first.
    finished: VecDeque<EntryId>,
    retention: usize,
    completed_total: usize,
    failed_total: usize,
    next_entry_id: EntryId,
    next_token: u64,
    closed: bool,
}

impl QueueState {
    fn new(retention: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ready: HashMap::new(),
            finished: VecDeque::new(),
            retention,
            completed_total: 0,
            failed_total: 0,
            next_entry_id: 0,
            next_token: 0,
            closed: false,
        }
    }

    fn allocate_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts {
            completed: self.completed_total,
            failed: self.failed_total,
            ..Default::default()
        };
        for entry in self.entries.values() {
            match entry.status {
                EntryStatus::Waiting => counts.waiting += 1,
                EntryStatus::Active { .. } => counts.active += 1,
                EntryStatus::Completed(_) | EntryStatus::Failed(_) => {}
            }
        }
        counts
    }

    /// Record a final status and drop the oldest finished entries past the retention.
    fn finish(&mut self, id: EntryId, status: EntryStatus) {
        match status {
            EntryStatus::Completed(_) => self.completed_total += 1,
            EntryStatus::Failed(_) => self.failed_total += 1,
            EntryStatus::Waiting | EntryStatus::Active { .. } => {}
        }
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.status = status;
        self.finished.push_back(id);
        while self.finished.len() > self.retention {
            if let Some(oldest) = self.finished.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

pub struct InMemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    settings: QueueSettings,
}

impl InMemoryJobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self::with_retention(settings, DEFAULT_FINISHED_RETENTION)
    }

    /// Keep at most `retention` finished entries around for `result`.
    pub fn with_retention(settings: QueueSettings, retention: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::new(retention))),
            notify: Arc::new(Notify::new()),
            settings,
        }
    }

    pub async fn enqueue(&self, job_type: impl Into<String>, job: Job) -> Result<(), WorkerError> {
        job.validate()?;
        let job_type = job_type.into();
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(WorkerError::BackendUnavailable("queue is closed".to_string()));
            }
            let id = state.next_entry_id;
            state.next_entry_id += 1;
            state.entries.insert(
                id,
                QueueEntry {
                    job,
                    job_type: job_type.clone(),
                    status: EntryStatus::Waiting,
                    stalled_count: 0,
                },
            );
            state.ready.entry(job_type).or_default().push_back(id);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Stop handing out jobs; pending `next` calls return `None`.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Nothing waiting and nothing leased.
    pub async fn is_idle(&self) -> bool {
        let counts = self.counts().await;
        counts.waiting == 0 && counts.active == 0
    }

    /// Resolve once the queue is idle.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle().await {
                return;
            }
            notified.await;
        }
    }

    pub async fn counts(&self) -> QueueCounts {
        self.state.lock().await.counts()
    }

    /// Final acknowledgment recorded for the latest delivery of `job_id`.
    ///
    /// `None` once the entry has been pruned.
    pub async fn result(&self, job_id: &JobId) -> Option<JobResult> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .filter(|(_, entry)| &entry.job.job_id == job_id)
            .max_by_key(|(id, _)| **id)
            .and_then(|(_, entry)| match &entry.status {
                EntryStatus::Completed(value) => Some(Ok(value.clone())),
                EntryStatus::Failed(error) => Some(Err(error.clone())),
                _ => None,
            })
    }

    /// Redeliver (or fail) every leased job whose lock has expired.
    ///
    /// Returns how many jobs were moved.
    pub async fn check_stalled(&self) -> usize {
        let now = Instant::now();
        let moved = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let expired: Vec<EntryId> = state
                .entries
                .iter()
                .filter(|(_, entry)| {
                    matches!(entry.status, EntryStatus::Active { lock_expires_at, .. } if lock_expires_at <= now)
                })
                .map(|(id, _)| *id)
                .collect();

            for id in &expired {
                let Some(entry) = state.entries.get_mut(id) else {
                    continue;
                };
                entry.stalled_count += 1;
                if entry.stalled_count > self.settings.max_stalled_count {
                    tracing::warn!(job_id = %entry.job.job_id, "job stalled too often, failing it");
                    state.finish(*id, EntryStatus::Failed(STALLED_LIMIT_MESSAGE.to_string()));
                } else {
                    tracing::warn!(job_id = %entry.job.job_id, "job lock expired, redelivering");
                    entry.status = EntryStatus::Waiting;
                    let job_type = entry.job_type.clone();
                    state.ready.entry(job_type).or_default().push_back(*id);
                }
            }
            expired.len()
        };
        if moved > 0 {
            self.notify.notify_waiters();
        }
        moved
    }

    /// Run `check_stalled` every `stalled_interval` until `shutdown` fires.
    pub fn spawn_stalled_checker(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.settings.stalled_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        queue.check_stalled().await;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn next(&self, job_type: &str) -> Option<Box<dyn JobLease>> {
        loop {
            // register interest before looking, so an enqueue in between is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                let next_id = state.ready.get_mut(job_type).and_then(VecDeque::pop_front);
                if let Some(id) = next_id {
                    let token = state.allocate_token();
                    let lock_expires_at = Instant::now() + self.settings.lock_duration;
                    if let Some(entry) = state.entries.get_mut(&id) {
                        entry.status = EntryStatus::Active {
                            token,
                            lock_expires_at,
                        };
                        let job = entry.job.clone();
                        let renewal = spawn_lock_renewal(
                            Arc::clone(&self.state),
                            id,
                            token,
                            self.settings.lock_duration,
                        );
                        return Some(Box::new(InMemoryLease {
                            entry_id: id,
                            token,
                            job,
                            state: Arc::clone(&self.state),
                            notify: Arc::clone(&self.notify),
                            renewal,
                        }));
                    }
                    continue;
                }
            }

            notified.await;
        }
    }
}

fn spawn_lock_renewal(
    state: Arc<Mutex<QueueState>>,
    entry_id: EntryId,
    token: u64,
    lock_duration: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(lock_duration / 2);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut state = state.lock().await;
            let Some(entry) = state.entries.get_mut(&entry_id) else {
                break;
            };
            match &mut entry.status {
                EntryStatus::Active {
                    token: current,
                    lock_expires_at,
                } if *current == token => {
                    *lock_expires_at = Instant::now() + lock_duration;
                }
                // redelivered or finished
                _ => break,
            }
        }
    })
}

struct InMemoryLease {
    entry_id: EntryId,
    token: u64,
    job: Job,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    renewal: JoinHandle<()>,
}

impl Drop for InMemoryLease {
    fn drop(&mut self) {
        // an abandoned lease lets its lock expire
        self.renewal.abort();
    }
}

#[async_trait]
impl JobLease for InMemoryLease {
    fn job(&self) -> &Job {
        &self.job
    }

    async fn done(self: Box<Self>, result: JobResult) -> Result<(), WorkerError> {
        self.renewal.abort();
        {
            let mut state = self.state.lock().await;
            let entry = state.entries.get(&self.entry_id).ok_or_else(|| {
                WorkerError::BackendUnavailable(format!("unknown queue entry for job {}", self.job.job_id))
            })?;
            match entry.status {
                EntryStatus::Active { token, .. } if token == self.token => {}
                _ => {
                    return Err(WorkerError::BackendUnavailable(format!(
                        "lease for job {} is no longer held",
                        self.job.job_id
                    )));
                }
            }
            let status = match result {
                Ok(value) => EntryStatus::Completed(value),
                Err(error) => EntryStatus::Failed(error),
            };
            state.finish(self.entry_id, status);
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
