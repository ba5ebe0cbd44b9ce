//! WorkerBuilder - ワーカーの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - store / queue が未設定なら `BuildError` を返す
//! - 設定値は `WorkerConfig::validate()` で起動時に検証する
//! - sandbox と decision policy は省略時に設定から作る

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::discovery::DiscoveryReporter;
use super::lifecycle::JobLifecycle;
use super::worker_loop::{RunSummary, WorkerLoop};
use crate::config::WorkerConfig;
use crate::impls::{QuickJsSandbox, policy};
use crate::ports::{CodeSandbox, DecisionPolicy, JobQueue, StateStore};

/// WorkerBuilder はワーカーを構築
///
/// # 使用例
/// ```ignore
/// let worker = WorkerBuilder::new(WorkerConfig::new("green-alg"))
///     .store(Arc::new(InMemoryStateStore::new()))
///     .queue(queue.clone())
///     .build()?;
/// worker.run(shutdown).await;
/// ```
pub struct WorkerBuilder {
    config: WorkerConfig,
    store: Option<Arc<dyn StateStore>>,
    queue: Option<Arc<dyn JobQueue>>,
    sandbox: Option<Arc<dyn CodeSandbox>>,
    policy: Option<Arc<dyn DecisionPolicy>>,
    instance_id: Option<String>,
}

/// BuildError はワーカー構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("No state store configured. Call WorkerBuilder::store() before build().")]
    MissingStore,

    #[error("No job queue configured. Call WorkerBuilder::queue() before build().")]
    MissingQueue,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl WorkerBuilder {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            store: None,
            queue: None,
            sandbox: None,
            policy: None,
            instance_id: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Override the sandbox built from `config.sandbox`.
    pub fn sandbox(mut self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Override the policy built from `config.policy`.
    pub fn policy(mut self, policy: Arc<dyn DecisionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Fix the discovery instance id (generated otherwise).
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn build(self) -> Result<Worker, BuildError> {
        self.config
            .validate()
            .map_err(|e| BuildError::InvalidConfig(e.to_string()))?;
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let queue = self.queue.ok_or(BuildError::MissingQueue)?;

        let sandbox: Arc<dyn CodeSandbox> = match self.sandbox {
            Some(sandbox) => sandbox,
            None => Arc::new(QuickJsSandbox::new(self.config.sandbox.clone())),
        };
        let decision: Arc<dyn DecisionPolicy> = match self.policy {
            Some(decision) => decision,
            None => Arc::from(policy::from_config(&self.config.policy)),
        };

        let service_name = self.config.discovery.service_name.clone();
        let algorithm = self.config.algorithm.clone();
        let discovery = Arc::new(match self.instance_id {
            Some(instance_id) => DiscoveryReporter::with_instance_id(
                Arc::clone(&store),
                service_name,
                algorithm,
                instance_id,
            ),
            None => DiscoveryReporter::new(Arc::clone(&store), service_name, algorithm),
        });

        let lifecycle = JobLifecycle::new(
            store,
            Arc::clone(&discovery),
            sandbox,
            decision,
            self.config.timer.clone(),
        );

        Ok(Worker {
            config: self.config,
            queue,
            lifecycle,
            discovery,
        })
    }
}

/// A wired worker: discovery reporter, lifecycle and consume loop.
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<dyn JobQueue>,
    lifecycle: Arc<JobLifecycle>,
    discovery: Arc<DiscoveryReporter>,
}

impl Worker {
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<JobLifecycle> {
        &self.lifecycle
    }

    pub fn discovery(&self) -> &Arc<DiscoveryReporter> {
        &self.discovery
    }

    /// Register for discovery, then consume jobs until `shutdown` fires or the
    /// queue closes. In-flight jobs are drained before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> RunSummary {
        if let Err(e) = self.discovery.register().await {
            tracing::warn!(error = %e, "discovery registration failed");
        }

        let heartbeat_stop = shutdown.child_token();
        let heartbeat = tokio::spawn({
            let discovery = Arc::clone(&self.discovery);
            let interval = self.config.discovery.interval;
            let stop = heartbeat_stop.clone();
            async move { discovery.run(interval, stop).await }
        });

        let worker_loop = WorkerLoop::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.lifecycle),
            self.config.algorithm.clone(),
            self.config.queue.concurrency,
        );
        let summary = worker_loop.run(shutdown).await;

        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            tracing::warn!(error = %e, "discovery reporter task failed");
        }
        summary
    }
}
