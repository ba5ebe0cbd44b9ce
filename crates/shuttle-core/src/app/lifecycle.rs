//! JobLifecycle - 1 ジョブの状態機械
//!
//! # フロー
//! 1. `start()`: Queued -> Active、ジョブごとの context を作って処理タスクを spawn
//! 2. discovery にジョブ識別子を記録
//! 3. 停止 watch を登録（timer を仕掛ける前に完了させる）
//!    登録に成功したタスクだけが watch を保持し、resolve で解除する
//! 4. タスク状態 `active` を書く
//! 5. sandbox（コードあり）か decision policy（コードなし）で結果を出す
//! 6. completion timer が発火したら `resolve(Timer)`
//!
//! 停止通知は watch callback から `resolve(Stop)` を呼ぶ。
//!
//! # resolve
//! CompletionGuard の compare-and-set に勝った 1 回だけが進む。
//! terminal 状態の書き込み・watch 解除の失敗はログに残し、ack は必ず行う。

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::discovery::DiscoveryReporter;
use super::guard::CompletionGuard;
use super::watch::{EventCallback, WatchCoordinator};
use crate::config::TimerPolicy;
use crate::domain::{
    DiscoveryUpdate, Job, JobEvent, JobId, JobState, Resolution, TaskId, TaskStateUpdate,
    WorkerError, WorkerStatus,
};
use crate::ports::{CodeSandbox, DecisionPolicy, JobLease, StateStore};

type JobKey = (JobId, TaskId);

/// Everything owned by one in-flight job.
struct JobContext {
    job: Job,
    state: Mutex<JobState>,
    guard: CompletionGuard,
    /// Cancels the pending computation and timer once resolved.
    cancel: CancellationToken,
    lease: Mutex<Option<Box<dyn JobLease>>>,
    /// Orders the `active` write before the terminal one.
    store_writes: tokio::sync::Mutex<()>,
    /// Set while this task holds a watch registration.
    watch_held: tokio::sync::Mutex<bool>,
    done: watch::Sender<Option<JobState>>,
}

impl JobContext {
    fn key(&self) -> JobKey {
        (self.job.job_id.clone(), self.job.task_id.clone())
    }

    fn transition(&self, next: JobState) -> Result<JobState, WorkerError> {
        let mut state = self.state.lock();
        *state = state.transition(next)?;
        Ok(*state)
    }
}

/// Waitable view of a started job. Dropping it does not affect the job.
pub struct JobHandle {
    job_id: JobId,
    task_id: TaskId,
    outcome: watch::Receiver<Option<JobState>>,
}

impl JobHandle {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Wait for the terminal state.
    ///
    /// `None` only if the lifecycle went away before resolving the job.
    pub async fn wait(mut self) -> Option<JobState> {
        self.outcome
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|state| *state)
    }
}

pub struct JobLifecycle {
    store: Arc<dyn StateStore>,
    watches: WatchCoordinator,
    discovery: Arc<DiscoveryReporter>,
    sandbox: Arc<dyn CodeSandbox>,
    policy: Arc<dyn DecisionPolicy>,
    timer: TimerPolicy,
    active: Mutex<HashMap<JobKey, Arc<JobContext>>>,
}

impl JobLifecycle {
    pub fn new(
        store: Arc<dyn StateStore>,
        discovery: Arc<DiscoveryReporter>,
        sandbox: Arc<dyn CodeSandbox>,
        policy: Arc<dyn DecisionPolicy>,
        timer: TimerPolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let this = this.clone();
            let on_event: EventCallback = Arc::new(move |event| Self::on_event(&this, event));
            Self {
                watches: WatchCoordinator::new(Arc::clone(&store), on_event),
                store,
                discovery,
                sandbox,
                policy,
                timer,
                active: Mutex::new(HashMap::new()),
            }
        })
    }

    /// Begin processing a delivered job and return immediately.
    pub fn start(self: &Arc<Self>, lease: Box<dyn JobLease>) -> JobHandle {
        let job = lease.job().clone();
        let (done, outcome) = watch::channel(None);
        let ctx = Arc::new(JobContext {
            job,
            state: Mutex::new(JobState::Queued),
            guard: CompletionGuard::new(),
            cancel: CancellationToken::new(),
            lease: Mutex::new(Some(lease)),
            store_writes: tokio::sync::Mutex::new(()),
            watch_held: tokio::sync::Mutex::new(false),
            done,
        });
        if let Err(e) = ctx.transition(JobState::Active) {
            tracing::warn!(job_id = %ctx.job.job_id, error = %e, "unexpected state transition");
        }

        let handle = JobHandle {
            job_id: ctx.job.job_id.clone(),
            task_id: ctx.job.task_id.clone(),
            outcome,
        };

        if let Some(previous) = self.active.lock().insert(ctx.key(), Arc::clone(&ctx)) {
            tracing::warn!(
                job_id = %previous.job.job_id,
                task_id = %previous.job.task_id,
                "task delivered again while still active"
            );
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(ctx).await });
        handle
    }

    pub fn active_jobs(&self) -> usize {
        self.active.lock().len()
    }

    pub fn watches(&self) -> &WatchCoordinator {
        &self.watches
    }

    async fn run(self: Arc<Self>, ctx: Arc<JobContext>) {
        let job = &ctx.job;
        if ctx.guard.is_claimed() {
            return;
        }
        tracing::info!(job_id = %job.job_id, task_id = %job.task_id, "job started");

        self.discovery.update(DiscoveryUpdate::job_started(job)).await;

        {
            let mut held = ctx.watch_held.lock().await;
            // a stop for another task of the same job may have resolved this one already
            if !ctx.guard.is_claimed() {
                match self.watches.register(&job.job_id).await {
                    Ok(()) => *held = true,
                    Err(e) => tracing::warn!(
                        job_id = %job.job_id,
                        error = %e,
                        "watch registration failed; job cannot be stopped externally"
                    ),
                }
            }
        }

        {
            let _writes = ctx.store_writes.lock().await;
            if !ctx.guard.is_claimed() {
                let update = TaskStateUpdate::active(job.job_id.clone(), job.task_id.clone());
                if let Err(e) = self.store.set_task_state(&update).await {
                    tracing::warn!(job_id = %job.job_id, error = %e, "failed to write active status");
                }
            }
        }

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            result = self.compute(job) => result,
        };

        let delay = self.timer.next_delay();
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        self.resolve(&ctx, Resolution::from_result(result)).await;
    }

    async fn compute(&self, job: &Job) -> Result<serde_json::Value, String> {
        match job.code() {
            Some(code) => self
                .sandbox
                .evaluate(code, &job.input)
                .await
                .map_err(|e| e.to_string()),
            None => self.policy.decide(job).map_err(|e| e.to_string()),
        }
    }

    fn on_event(this: &Weak<Self>, event: JobEvent) {
        let Some(this) = this.upgrade() else {
            return;
        };
        let targets: Vec<Arc<JobContext>> = this
            .active
            .lock()
            .values()
            .filter(|ctx| ctx.job.job_id == event.job_id)
            .cloned()
            .collect();
        if targets.is_empty() {
            tracing::debug!(job_id = %event.job_id, "event for a job that is not active here");
            return;
        }

        tracing::info!(job_id = %event.job_id, "stop requested");
        for ctx in targets {
            let this = Arc::clone(&this);
            let resolution = Resolution::stopped(&event);
            tokio::spawn(async move { this.resolve(&ctx, resolution).await });
        }
    }

    async fn resolve(&self, ctx: &Arc<JobContext>, resolution: Resolution) {
        let job = &ctx.job;
        if !ctx.guard.try_claim() {
            let duplicate = WorkerError::DuplicateCompletion(job.job_id.clone());
            tracing::debug!(
                task_id = %job.task_id,
                source = ?resolution.source,
                "{duplicate}; dropping"
            );
            return;
        }
        ctx.cancel.cancel();

        let terminal = resolution.terminal_state();
        if let Err(e) = ctx.transition(terminal) {
            tracing::warn!(job_id = %job.job_id, error = %e, "unexpected state transition");
        }

        {
            let _writes = ctx.store_writes.lock().await;
            let update =
                TaskStateUpdate::terminal(job.job_id.clone(), job.task_id.clone(), &resolution);
            if let Err(e) = self.store.set_task_state(&update).await {
                tracing::warn!(job_id = %job.job_id, error = %e, "failed to write final status");
            }
        }

        let held = std::mem::take(&mut *ctx.watch_held.lock().await);
        if held && let Err(e) = self.watches.deregister(&job.job_id).await {
            tracing::warn!(job_id = %job.job_id, error = %e, "failed to deregister watch");
        }

        let idle = {
            let mut active = self.active.lock();
            active.remove(&ctx.key());
            active.is_empty()
        };

        let lease = ctx.lease.lock().take();
        if let Some(lease) = lease
            && let Err(e) = lease.done(resolution.acknowledgment()).await
        {
            tracing::warn!(job_id = %job.job_id, error = %e, "failed to acknowledge job");
        }

        if idle {
            self.discovery
                .update(DiscoveryUpdate::status(WorkerStatus::Ready))
                .await;
        }

        match &resolution.error {
            Some(error) => tracing::info!(
                job_id = %job.job_id,
                task_id = %job.task_id,
                state = ?terminal,
                error = %error,
                "job resolved"
            ),
            None => tracing::info!(
                job_id = %job.job_id,
                task_id = %job.task_id,
                state = ?terminal,
                "job resolved"
            ),
        }
        ctx.done.send_replace(Some(terminal));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExecutionError;
    use crate::impls::{InMemoryStateStore, QuickJsSandbox, StoreCall, ThresholdPolicy};
    use crate::ports::JobResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct RecordingLease {
        job: Job,
        acks: Arc<Mutex<Vec<JobResult>>>,
    }

    #[async_trait]
    impl JobLease for RecordingLease {
        fn job(&self) -> &Job {
            &self.job
        }

        async fn done(self: Box<Self>, result: JobResult) -> Result<(), WorkerError> {
            self.acks.lock().push(result);
            Ok(())
        }
    }

    struct FixedPolicy(serde_json::Value);

    impl DecisionPolicy for FixedPolicy {
        fn decide(&self, _job: &Job) -> Result<serde_json::Value, ExecutionError> {
            Ok(self.0.clone())
        }
    }

    fn lifecycle(store: &Arc<InMemoryStateStore>, timer: TimerPolicy) -> Arc<JobLifecycle> {
        let discovery = Arc::new(DiscoveryReporter::with_instance_id(
            store.clone(),
            "worker-stub",
            "green-alg",
            "i-1",
        ));
        JobLifecycle::new(
            store.clone(),
            discovery,
            Arc::new(QuickJsSandbox::default()),
            Arc::new(ThresholdPolicy::new(10.0)),
            timer,
        )
    }

    fn lease(job: Job) -> (Box<dyn JobLease>, Arc<Mutex<Vec<JobResult>>>) {
        let acks = Arc::new(Mutex::new(Vec::new()));
        let lease = RecordingLease {
            job,
            acks: Arc::clone(&acks),
        };
        (Box::new(lease), acks)
    }

    fn context(job: Job, lease: Box<dyn JobLease>) -> Arc<JobContext> {
        let (done, _) = watch::channel(None);
        Arc::new(JobContext {
            job,
            state: Mutex::new(JobState::Active),
            guard: CompletionGuard::new(),
            cancel: CancellationToken::new(),
            lease: Mutex::new(Some(lease)),
            store_writes: tokio::sync::Mutex::new(()),
            watch_held: tokio::sync::Mutex::new(false),
            done,
        })
    }

    fn terminal_writes(store: &InMemoryStateStore, job_id: &JobId) -> usize {
        store
            .task_updates(job_id)
            .iter()
            .filter(|u| u.status.is_terminal())
            .count()
    }

    #[tokio::test]
    async fn racing_resolutions_complete_exactly_once() {
        let store = Arc::new(InMemoryStateStore::new());
        let lifecycle = lifecycle(&store, TimerPolicy::default());
        let job = Job::new(JobId::new("j1"), TaskId::new("t1"), vec![json!(3)]);
        let (lease, acks) = lease(job.clone());
        let ctx = context(job, lease);

        let stop = JobEvent::stop(JobId::new("j1"));
        tokio::join!(
            lifecycle.resolve(&ctx, Resolution::completed(json!(3))),
            lifecycle.resolve(&ctx, Resolution::stopped(&stop)),
        );

        assert_eq!(acks.lock().len(), 1);
        assert_eq!(terminal_writes(&store, &JobId::new("j1")), 1);
        assert!(ctx.state.lock().is_terminal());
        assert!(ctx.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn late_resolution_is_dropped() {
        let store = Arc::new(InMemoryStateStore::new());
        let lifecycle = lifecycle(&store, TimerPolicy::default());
        let job = Job::new(JobId::new("j1"), TaskId::new("t1"), vec![json!(3)]);
        let (lease, acks) = lease(job.clone());
        let ctx = context(job, lease);

        lifecycle
            .resolve(&ctx, Resolution::completed(json!(3)))
            .await;
        lifecycle
            .resolve(&ctx, Resolution::stopped(&JobEvent::stop(JobId::new("j1"))))
            .await;

        assert_eq!(*acks.lock(), vec![Ok(Some(json!(3)))]);
        assert_eq!(*ctx.state.lock(), JobState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_is_registered_before_the_timer_and_released_after() {
        let store = Arc::new(InMemoryStateStore::new());
        let lifecycle = lifecycle(&store, TimerPolicy::Fixed(Duration::from_millis(500)));
        let job = Job::new(JobId::new("j1"), TaskId::new("t1"), vec![json!(3)]);
        let (lease, _acks) = lease(job);

        let handle = lifecycle.start(lease);
        assert_eq!(handle.wait().await, Some(JobState::Succeeded));

        let order: Vec<&'static str> = store
            .calls()
            .iter()
            .filter_map(|call| match call {
                StoreCall::Watch(_) => Some("watch"),
                StoreCall::SetState(u) if u.status.is_terminal() => Some("final"),
                StoreCall::SetState(_) => Some("active"),
                StoreCall::Unwatch(_) => Some("unwatch"),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["watch", "active", "final", "unwatch"]);
        assert_eq!(lifecycle.active_jobs(), 0);
        assert!(lifecycle.watches().is_empty());
    }

    #[tokio::test]
    async fn injected_policy_decides_jobs_without_code() {
        let store = Arc::new(InMemoryStateStore::new());
        let discovery = Arc::new(DiscoveryReporter::new(store.clone(), "svc", "alg"));
        let lifecycle = JobLifecycle::new(
            store.clone(),
            discovery,
            Arc::new(QuickJsSandbox::default()),
            Arc::new(FixedPolicy(json!("fixed"))),
            TimerPolicy::Fixed(Duration::ZERO),
        );
        let job = Job::new(JobId::new("j1"), TaskId::new("t1"), vec![json!(999)]);
        let (lease, acks) = lease(job);

        assert_eq!(lifecycle.start(lease).wait().await, Some(JobState::Succeeded));
        assert_eq!(*acks.lock(), vec![Ok(Some(json!("fixed")))]);
    }
}
