//! EtcdStateStore - etcd v3 JSON gateway 経由の協調ストア
//!
//! # キー配置
//! - タスク状態: `/jobs/tasks/{jobId}/{taskId}`
//! - ジョブ watch: `/jobs/{jobId}/state`（PUT は停止要求として扱う）
//! - discovery: `/discovery/{serviceName}/{instanceId}`
//!
//! # 実装
//! - 書き込みは `POST /v3/kv/put`（key / value は base64）
//! - watch は `POST /v3/watch` の streaming response を改行区切り JSON として読む
//! - `created` フレームが届くまで `watch_job` は戻らない
//! - unwatch は転送タスクを abort する（接続が切れると etcd 側の watch も消える）

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::StoreConfig;
use crate::domain::{
    DiscoveryKey, DiscoveryRecord, JobEvent, JobId, TaskId, TaskStateUpdate, WorkerError,
};
use crate::ports::{JobWatch, StateStore};

pub fn task_key(job_id: &JobId, task_id: &TaskId) -> String {
    format!("/jobs/tasks/{job_id}/{task_id}")
}

pub fn job_state_key(job_id: &JobId) -> String {
    format!("/jobs/{job_id}/state")
}

pub fn discovery_key(key: &DiscoveryKey) -> String {
    format!("/discovery/{}/{}", key.service_name, key.instance_id)
}

pub struct EtcdStateStore {
    client: reqwest::Client,
    config: StoreConfig,
    watches: Mutex<HashMap<JobId, JoinHandle<()>>>,
}

impl EtcdStateStore {
    pub fn new(config: StoreConfig) -> Result<Self, WorkerError> {
        // no client-wide timeout: watch responses stay open
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| WorkerError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            config,
            watches: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.endpoint())
    }

    async fn put_json<T: serde::Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), WorkerError> {
        let value = serde_json::to_vec(value).map_err(WorkerError::backend)?;
        let body = json!({
            "key": STANDARD.encode(key),
            "value": STANDARD.encode(value),
        });
        self.client
            .post(self.url("/v3/kv/put"))
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for EtcdStateStore {
    async fn set_task_state(&self, update: &TaskStateUpdate) -> Result<(), WorkerError> {
        self.put_json(&task_key(&update.job_id, &update.task_id), update)
            .await
    }

    async fn register_discovery(
        &self,
        key: &DiscoveryKey,
        record: &DiscoveryRecord,
    ) -> Result<(), WorkerError> {
        self.put_json(&discovery_key(key), record).await
    }

    async fn update_discovery(
        &self,
        key: &DiscoveryKey,
        record: &DiscoveryRecord,
    ) -> Result<(), WorkerError> {
        self.put_json(&discovery_key(key), record).await
    }

    async fn watch_job(&self, job_id: &JobId) -> Result<JobWatch, WorkerError> {
        let body = json!({
            "create_request": { "key": STANDARD.encode(job_state_key(job_id)) }
        });
        let response = self
            .client
            .post(self.url("/v3/watch"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let (events, watch) = JobWatch::channel();
        let (created_tx, created_rx) = oneshot::channel();
        let task = tokio::spawn(forward_watch(job_id.clone(), response, events, created_tx));

        match tokio::time::timeout(self.config.request_timeout, created_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                task.abort();
                return Err(WorkerError::BackendUnavailable(format!(
                    "watch stream for job {job_id} closed before it was created"
                )));
            }
            Err(_) => {
                task.abort();
                return Err(WorkerError::BackendUnavailable(format!(
                    "watch for job {job_id} was not confirmed in time"
                )));
            }
        }

        if let Some(previous) = self.watches.lock().insert(job_id.clone(), task) {
            previous.abort();
        }
        Ok(watch)
    }

    async fn unwatch_job(&self, job_id: &JobId) -> Result<(), WorkerError> {
        if let Some(task) = self.watches.lock().remove(job_id) {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for EtcdStateStore {
    fn drop(&mut self) {
        for (_, task) in self.watches.lock().drain() {
            task.abort();
        }
    }
}

#[derive(Debug, Deserialize)]
struct WatchFrame {
    result: Option<WatchResult>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct WatchResult {
    #[serde(default)]
    created: bool,
    #[serde(default)]
    canceled: bool,
    #[serde(default)]
    events: Vec<WatchEvent>,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    /// Omitted for PUT (the zero value of the enum).
    #[serde(default, rename = "type")]
    kind: Option<String>,
    kv: Option<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    value: Option<String>,
}

/// What one line of the watch stream means for the subscriber.
#[derive(Debug, Default, PartialEq)]
struct FrameOutcome {
    created: bool,
    closed: bool,
    events: Vec<JobEvent>,
}

fn decode_frame(job_id: &JobId, line: &[u8]) -> Result<FrameOutcome, WorkerError> {
    let frame: WatchFrame = serde_json::from_slice(line).map_err(WorkerError::backend)?;
    if let Some(error) = frame.error {
        return Err(WorkerError::BackendUnavailable(format!("watch error: {error}")));
    }
    let result = frame.result.unwrap_or_default();

    let events = result
        .events
        .into_iter()
        .filter(|event| event.kind.as_deref().unwrap_or("PUT") == "PUT")
        .map(|event| {
            let payload = event
                .kv
                .and_then(|kv| kv.value)
                .map(|value| decode_payload(&value))
                .unwrap_or(serde_json::Value::Null);
            JobEvent::new(job_id.clone(), payload)
        })
        .collect();

    Ok(FrameOutcome {
        created: result.created,
        closed: result.canceled,
        events,
    })
}

/// Stored values are JSON when we can read them, plain text otherwise.
fn decode_payload(encoded: &str) -> serde_json::Value {
    let Ok(bytes) = STANDARD.decode(encoded) else {
        return serde_json::Value::Null;
    };
    serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned()))
}

async fn forward_watch(
    job_id: JobId,
    response: reqwest::Response,
    events: mpsc::UnboundedSender<JobEvent>,
    created: oneshot::Sender<()>,
) {
    let mut created = Some(created);
    let mut buffer: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "watch stream failed");
                return;
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let outcome = match decode_frame(&job_id, &line) {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "unreadable watch frame");
                    continue;
                }
            };
            if outcome.created
                && let Some(created) = created.take()
            {
                let _ = created.send(());
            }
            for event in outcome.events {
                if events.send(event).is_err() {
                    return;
                }
            }
            if outcome.closed {
                tracing::debug!(job_id = %job_id, "watch canceled by the store");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(text: &str) -> String {
        STANDARD.encode(text)
    }

    #[test]
    fn keys_follow_the_store_layout() {
        let job = JobId::new("main:1");
        assert_eq!(task_key(&job, &TaskId::new("t1")), "/jobs/tasks/main:1/t1");
        assert_eq!(job_state_key(&job), "/jobs/main:1/state");
        assert_eq!(
            discovery_key(&DiscoveryKey {
                service_name: "worker-stub".into(),
                instance_id: "i-1".into(),
            }),
            "/discovery/worker-stub/i-1"
        );
    }

    #[test]
    fn created_frame_has_no_events() {
        let line = br#"{"result":{"header":{"revision":"5"},"created":true}}"#;
        let outcome = decode_frame(&JobId::new("j1"), line).unwrap();
        assert!(outcome.created);
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn put_events_become_job_events_and_deletes_are_skipped() {
        let line = format!(
            r#"{{"result":{{"events":[{{"kv":{{"key":"{}","value":"{}"}}}},{{"type":"DELETE","kv":{{"key":"{}"}}}}]}}}}"#,
            b64("/jobs/j1/state"),
            b64(r#"{"state":"stop","error":"pipeline failed"}"#),
            b64("/jobs/j1/state"),
        );
        let outcome = decode_frame(&JobId::new("j1"), line.as_bytes()).unwrap();

        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].job_id, JobId::new("j1"));
        assert_eq!(outcome.events[0].error().as_deref(), Some("pipeline failed"));
    }

    #[test]
    fn non_json_values_are_kept_as_text() {
        assert_eq!(decode_payload(&b64("stop")), serde_json::Value::String("stop".into()));
    }

    #[test]
    fn error_frames_are_reported() {
        let line = br#"{"error":{"grpc_code":14,"message":"unavailable"}}"#;
        assert!(matches!(
            decode_frame(&JobId::new("j1"), line),
            Err(WorkerError::BackendUnavailable(_))
        ));
    }
}
