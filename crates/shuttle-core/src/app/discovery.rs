//! DiscoveryReporter - ワーカーの生存・担当ジョブを公開する
//!
//! レコードはプロセス全体で 1 つ。書き換えるのは lifecycle だけで、
//! 公開の失敗はログに残すだけ（致命的にしない）。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::domain::{DiscoveryKey, DiscoveryRecord, DiscoveryUpdate, WorkerError};
use crate::ports::StateStore;

pub struct DiscoveryReporter {
    store: Arc<dyn StateStore>,
    key: DiscoveryKey,
    record: Mutex<DiscoveryRecord>,
}

impl DiscoveryReporter {
    pub fn new(
        store: Arc<dyn StateStore>,
        service_name: impl Into<String>,
        algorithm_name: impl Into<String>,
    ) -> Self {
        let instance_id = Ulid::new().to_string().to_lowercase();
        Self::with_instance_id(store, service_name, algorithm_name, instance_id)
    }

    pub fn with_instance_id(
        store: Arc<dyn StateStore>,
        service_name: impl Into<String>,
        algorithm_name: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            key: DiscoveryKey {
                service_name: service_name.into(),
                instance_id: instance_id.into(),
            },
            record: Mutex::new(DiscoveryRecord::new(algorithm_name)),
        }
    }

    pub fn key(&self) -> &DiscoveryKey {
        &self.key
    }

    pub fn snapshot(&self) -> DiscoveryRecord {
        self.record.lock().clone()
    }

    /// Announce this worker under its service name.
    pub async fn register(&self) -> Result<(), WorkerError> {
        let record = {
            let mut record = self.record.lock();
            record.updated_at = Some(chrono::Utc::now());
            record.clone()
        };
        self.store.register_discovery(&self.key, &record).await?;
        tracing::info!(
            service = %self.key.service_name,
            instance = %self.key.instance_id,
            "worker registered for discovery"
        );
        Ok(())
    }

    /// Merge `update` into the record and publish it.
    pub async fn update(&self, update: DiscoveryUpdate) {
        let record = {
            let mut record = self.record.lock();
            record.merge(update);
            record.clone()
        };
        self.publish_record(&record).await;
    }

    /// Re-publish the current record as is.
    pub async fn publish(&self) {
        let record = self.snapshot();
        self.publish_record(&record).await;
    }

    async fn publish_record(&self, record: &DiscoveryRecord) {
        if let Err(e) = self.store.update_discovery(&self.key, record).await {
            tracing::warn!(error = %e, "failed to publish discovery record");
        }
    }

    /// Re-publish every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately; register() already published
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.publish().await,
            }
        }
        tracing::debug!("discovery reporter stopped");
    }
}
