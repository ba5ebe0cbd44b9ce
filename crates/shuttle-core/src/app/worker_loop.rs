//! WorkerLoop - キューからジョブを取り出して lifecycle に渡すループ
//!
//! # フロー
//! 1. semaphore で空きスロットを待つ（同時実行数 = `QueueSettings::concurrency`）
//! 2. `JobQueue::next()` で lease を取得
//! 3. `JobLifecycle::start()` に渡し、終了を待つタスクにスロットを持たせる
//!
//! shutdown が来たら新しい lease は取らず、実行中のジョブが終わるのを待つ。

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::lifecycle::JobLifecycle;
use crate::domain::JobState;
use crate::ports::JobQueue;

/// Terminal states counted over one `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub stopped: usize,
}

impl RunSummary {
    fn record(&mut self, state: Option<JobState>) {
        match state {
            Some(JobState::Succeeded) => self.succeeded += 1,
            Some(JobState::Failed) => self.failed += 1,
            Some(JobState::Stopped) => self.stopped += 1,
            _ => {}
        }
    }
}

pub struct WorkerLoop {
    queue: Arc<dyn JobQueue>,
    lifecycle: Arc<JobLifecycle>,
    job_type: String,
    slots: Arc<Semaphore>,
}

impl WorkerLoop {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        lifecycle: Arc<JobLifecycle>,
        job_type: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            queue,
            lifecycle,
            job_type: job_type.into(),
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Consume jobs until `shutdown` fires or the queue closes, then drain.
    pub async fn run(&self, shutdown: CancellationToken) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut in_flight: JoinSet<Option<JobState>> = JoinSet::new();

        tracing::info!(job_type = %self.job_type, "worker loop started");
        loop {
            while let Some(finished) = in_flight.try_join_next() {
                summary.record(finished.ok().flatten());
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // lease は待つ可能性があるので shutdown と競合させる
            let lease = tokio::select! {
                _ = shutdown.cancelled() => break,
                lease = self.queue.next(&self.job_type) => lease,
            };
            let Some(lease) = lease else {
                tracing::info!("queue closed");
                break;
            };

            let handle = self.lifecycle.start(lease);
            summary.started += 1;
            tracing::debug!(
                job_id = %handle.job_id(),
                task_id = %handle.task_id(),
                in_flight = in_flight.len() + 1,
                "job handed to lifecycle"
            );
            in_flight.spawn(async move {
                let _permit = permit;
                handle.wait().await
            });
        }

        if !in_flight.is_empty() {
            tracing::info!(in_flight = in_flight.len(), "waiting for in-flight jobs");
        }
        while let Some(finished) = in_flight.join_next().await {
            summary.record(finished.ok().flatten());
        }
        tracing::info!(?summary, "worker loop stopped");
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::discovery::DiscoveryReporter;
    use crate::config::{QueueSettings, TimerPolicy};
    use crate::domain::{Job, JobId, TaskId};
    use crate::impls::{InMemoryJobQueue, InMemoryStateStore, QuickJsSandbox, ThresholdPolicy};
    use serde_json::json;
    use std::time::Duration;

    fn setup(concurrency: usize) -> (Arc<InMemoryJobQueue>, Arc<JobLifecycle>, WorkerLoop) {
        let store = Arc::new(InMemoryStateStore::new());
        let queue = Arc::new(InMemoryJobQueue::new(QueueSettings {
            concurrency,
            ..Default::default()
        }));
        let discovery = Arc::new(DiscoveryReporter::new(store.clone(), "svc", "green-alg"));
        let lifecycle = JobLifecycle::new(
            store,
            discovery,
            Arc::new(QuickJsSandbox::default()),
            Arc::new(ThresholdPolicy::new(10.0)),
            TimerPolicy::Fixed(Duration::from_millis(100)),
        );
        let worker = WorkerLoop::new(queue.clone(), lifecycle.clone(), "green-alg", concurrency);
        (queue, lifecycle, worker)
    }

    fn job(n: u64, first: i64) -> Job {
        Job::new(JobId::new(format!("j{n}")), TaskId::new(format!("t{n}")), vec![json!(first)])
    }

    #[tokio::test(start_paused = true)]
    async fn processes_until_the_queue_closes() {
        let (queue, _lifecycle, worker) = setup(1);
        queue.enqueue("green-alg", job(1, 3)).await.unwrap();
        queue.enqueue("green-alg", job(2, 11)).await.unwrap();

        let closer = tokio::spawn({
            let queue = queue.clone();
            async move {
                queue.wait_idle().await;
                queue.close().await;
            }
        });

        let summary = worker.run(CancellationToken::new()).await;
        closer.await.unwrap();

        assert_eq!(summary.started, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(queue.result(&JobId::new("j2")).await, Some(Err("input 11 exceeds threshold 10".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_bounds_in_flight_jobs() {
        let (queue, lifecycle, worker) = setup(2);
        for n in 0..5 {
            queue.enqueue("green-alg", job(n, 1)).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lifecycle.active_jobs(), 2);
        assert_eq!(queue.counts().await.waiting, 3);

        queue.wait_idle().await;
        shutdown.cancel();
        let summary = runner.await.unwrap();
        assert_eq!(summary.started, 5);
        assert_eq!(summary.succeeded, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_in_flight_jobs() {
        let (queue, lifecycle, worker) = setup(1);
        queue.enqueue("green-alg", job(1, 3)).await.unwrap();

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();
        let summary = runner.await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(lifecycle.active_jobs(), 0);
        assert_eq!(queue.result(&JobId::new("j1")).await, Some(Ok(Some(json!(3)))));
    }
}
