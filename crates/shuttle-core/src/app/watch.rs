//! WatchCoordinator - ジョブごとの停止 watch を管理する
//!
//! # 設計原則
//! - 登録は jobId で索引する（同じ jobId の並行タスクは 1 本の watch を共有し、参照数で管理）
//! - jobId ごとの slot ロックで store への watch / unwatch を直列化する
//!   （同じ jobId に対して `watch_job` が並行に走ることはない）
//! - すべての変更イベントは 1 つの callback に渡す
//! - 未登録・解除済みの jobId に対する `deregister` は成功扱い

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::domain::{JobEvent, JobId, WorkerError};
use crate::ports::StateStore;

/// Receives every change event of every registered watch.
pub type EventCallback = Arc<dyn Fn(JobEvent) + Send + Sync>;

#[derive(Default)]
struct Slot {
    state: tokio::sync::Mutex<SlotState>,
    live: AtomicBool,
}

#[derive(Default)]
struct SlotState {
    forwarder: Option<JoinHandle<()>>,
    holders: usize,
}

pub struct WatchCoordinator {
    store: Arc<dyn StateStore>,
    on_event: EventCallback,
    slots: Mutex<HashMap<JobId, Arc<Slot>>>,
}

impl WatchCoordinator {
    pub fn new(store: Arc<dyn StateStore>, on_event: EventCallback) -> Self {
        Self {
            store,
            on_event,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to stop requests for `job_id`.
    ///
    /// Returns once the subscription is live on the store side.
    pub async fn register(&self, job_id: &JobId) -> Result<(), WorkerError> {
        loop {
            let slot = self.slot(job_id);
            let mut state = slot.state.lock().await;
            // released and retired while we waited
            if !self.is_current(job_id, &slot) {
                continue;
            }

            if state.forwarder.is_none() {
                let mut watch = match self.store.watch_job(job_id).await {
                    Ok(watch) => watch,
                    Err(e) => {
                        self.retire(job_id, &slot);
                        return Err(e);
                    }
                };
                let on_event = Arc::clone(&self.on_event);
                state.forwarder = Some(tokio::spawn(async move {
                    while let Some(event) = watch.recv().await {
                        on_event(event);
                    }
                }));
                slot.live.store(true, Ordering::SeqCst);
                tracing::debug!(job_id = %job_id, "watch registered");
            }
            state.holders += 1;
            return Ok(());
        }
    }

    /// Drop one hold on the watch; the last one unsubscribes from the store.
    pub async fn deregister(&self, job_id: &JobId) -> Result<(), WorkerError> {
        let Some(slot) = self.slots.lock().get(job_id).cloned() else {
            return Ok(());
        };
        let mut state = slot.state.lock().await;
        if state.holders == 0 {
            return Ok(());
        }
        state.holders -= 1;
        if state.holders > 0 {
            return Ok(());
        }

        if let Some(forwarder) = state.forwarder.take() {
            forwarder.abort();
        }
        slot.live.store(false, Ordering::SeqCst);
        // the slot stays indexed until the store call returns, so a new
        // registration for the same job waits behind it
        let result = self.store.unwatch_job(job_id).await;
        self.retire(job_id, &slot);
        drop(state);

        result?;
        tracing::debug!(job_id = %job_id, "watch deregistered");
        Ok(())
    }

    pub fn is_registered(&self, job_id: &JobId) -> bool {
        self.slots
            .lock()
            .get(job_id)
            .is_some_and(|slot| slot.live.load(Ordering::SeqCst))
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.live.load(Ordering::SeqCst))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, job_id: &JobId) -> Arc<Slot> {
        Arc::clone(self.slots.lock().entry(job_id.clone()).or_default())
    }

    fn is_current(&self, job_id: &JobId, slot: &Arc<Slot>) -> bool {
        self.slots
            .lock()
            .get(job_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn retire(&self, job_id: &JobId, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock();
        if slots
            .get(job_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryStateStore, StoreCall};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn coordinator() -> (
        Arc<InMemoryStateStore>,
        WatchCoordinator,
        mpsc::UnboundedReceiver<JobEvent>,
    ) {
        let store = Arc::new(InMemoryStateStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let on_event: EventCallback = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        let coordinator = WatchCoordinator::new(store.clone(), on_event);
        (store, coordinator, rx)
    }

    #[tokio::test]
    async fn events_reach_the_callback() {
        let (store, coordinator, mut events) = coordinator();
        let job_id = JobId::new("j1");

        coordinator.register(&job_id).await.unwrap();
        store.stop_job(&job_id, json!({"state": "stop"}));

        let event = events.recv().await.unwrap();
        assert_eq!(event.job_id, job_id);
    }

    #[tokio::test]
    async fn register_then_deregister_leaves_nothing_behind() {
        let (store, coordinator, _events) = coordinator();
        let job_id = JobId::new("j1");

        coordinator.register(&job_id).await.unwrap();
        assert!(coordinator.is_registered(&job_id));

        coordinator.deregister(&job_id).await.unwrap();
        assert!(coordinator.is_empty());
        assert!(!store.is_watching(&job_id));
        assert!(!store.stop_job(&job_id, json!({})));
    }

    #[tokio::test]
    async fn deregister_of_unknown_job_is_ok_and_silent() {
        let (store, coordinator, _events) = coordinator();

        coordinator.deregister(&JobId::new("never")).await.unwrap();
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn shared_watch_is_released_by_the_last_holder() {
        let (store, coordinator, _events) = coordinator();
        let job_id = JobId::new("j1");

        coordinator.register(&job_id).await.unwrap();
        coordinator.register(&job_id).await.unwrap();

        coordinator.deregister(&job_id).await.unwrap();
        assert!(store.is_watching(&job_id));

        coordinator.deregister(&job_id).await.unwrap();
        assert!(!store.is_watching(&job_id));
        assert_eq!(
            store.calls(),
            vec![StoreCall::Watch(job_id.clone()), StoreCall::Unwatch(job_id)]
        );
    }

    #[tokio::test]
    async fn failed_watch_leaves_no_registration() {
        let (store, coordinator, _events) = coordinator();
        store.fail_watch(true);

        let job_id = JobId::new("j1");
        assert!(coordinator.register(&job_id).await.is_err());
        assert!(!coordinator.is_registered(&job_id));
    }

    #[tokio::test]
    async fn concurrent_registrations_share_one_live_watch() {
        let (store, coordinator, mut events) = coordinator();
        store.yield_before_calls(true);
        let job_id = JobId::new("j1");

        let (first, second) = tokio::join!(
            coordinator.register(&job_id),
            coordinator.register(&job_id)
        );
        first.unwrap();
        second.unwrap();
        assert_eq!(store.calls(), vec![StoreCall::Watch(job_id.clone())]);

        assert!(store.stop_job(&job_id, json!({"state": "stop"})));
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.job_id, job_id);
    }

    #[tokio::test]
    async fn registration_during_release_gets_a_fresh_watch() {
        let (store, coordinator, mut events) = coordinator();
        store.yield_before_calls(true);
        let job_id = JobId::new("j1");
        coordinator.register(&job_id).await.unwrap();

        let (released, registered) = tokio::join!(
            coordinator.deregister(&job_id),
            coordinator.register(&job_id)
        );
        released.unwrap();
        registered.unwrap();

        assert_eq!(
            store.calls(),
            vec![
                StoreCall::Watch(job_id.clone()),
                StoreCall::Unwatch(job_id.clone()),
                StoreCall::Watch(job_id.clone()),
            ]
        );
        assert!(coordinator.is_registered(&job_id));
        assert!(store.stop_job(&job_id, json!({"state": "stop"})));
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.job_id, job_id);
    }
}
