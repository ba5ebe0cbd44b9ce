//! Outcome model: how a job ends and what gets written about it.
//!
//! This module does not assume a particular store or broker. It only defines
//! the "shape" of resolutions, stop notifications and task-state records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, TaskId};
use super::state::{JobState, TaskStatus};

/// Which signal resolved the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// The completion timer fired after the work was computed.
    Timer,
    /// A stop notification arrived through the job watch.
    Stop,
}

/// Argument of `resolve`: the first one to reach the completion guard wins.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub source: ResolutionSource,
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Resolution {
    pub fn completed(value: serde_json::Value) -> Self {
        Self {
            source: ResolutionSource::Timer,
            value: Some(value),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            source: ResolutionSource::Timer,
            value: None,
            error: Some(error.into()),
        }
    }

    /// Built from a watch notification; an `error` inside the payload is carried along.
    pub fn stopped(event: &JobEvent) -> Self {
        Self {
            source: ResolutionSource::Stop,
            value: None,
            error: event.error(),
        }
    }

    pub fn from_result(result: Result<serde_json::Value, String>) -> Self {
        match result {
            Ok(value) => Self::completed(value),
            Err(error) => Self::failed(error),
        }
    }

    /// Stopped regardless of computed value; otherwise error decides.
    pub fn terminal_state(&self) -> JobState {
        match self.source {
            ResolutionSource::Stop => JobState::Stopped,
            ResolutionSource::Timer if self.error.is_some() => JobState::Failed,
            ResolutionSource::Timer => JobState::Succeeded,
        }
    }

    /// What to hand back to the broker.
    ///
    /// - Succeeded: `Ok(value)`
    /// - Failed: `Err(message)`
    /// - Stopped: `Ok(None)` ("withdrawn"), or `Err` when the notification brought one
    pub fn acknowledgment(&self) -> Result<Option<serde_json::Value>, String> {
        match (&self.source, &self.error) {
            (_, Some(error)) => Err(error.clone()),
            (ResolutionSource::Stop, None) => Ok(None),
            (ResolutionSource::Timer, None) => Ok(self.value.clone()),
        }
    }
}

/// Change notification for a watched job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: JobId,
    /// Opaque payload; any event is read as "stop requested".
    pub payload: serde_json::Value,
}

impl JobEvent {
    pub fn new(job_id: JobId, payload: serde_json::Value) -> Self {
        Self { job_id, payload }
    }

    pub fn stop(job_id: JobId) -> Self {
        Self::new(job_id, serde_json::json!({ "state": "stop" }))
    }

    pub fn error(&self) -> Option<String> {
        self.payload
            .get("error")
            .and_then(|e| e.as_str())
            .map(str::to_string)
    }
}

/// Record written under the task key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStateUpdate {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl TaskStateUpdate {
    pub fn active(job_id: JobId, task_id: TaskId) -> Self {
        Self {
            job_id,
            task_id,
            status: TaskStatus::Active,
            result: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn terminal(job_id: JobId, task_id: TaskId, resolution: &Resolution) -> Self {
        let status = resolution
            .terminal_state()
            .task_status()
            .unwrap_or(TaskStatus::Failed);
        Self {
            job_id,
            task_id,
            status,
            result: resolution.value.clone(),
            error: resolution.error.clone(),
            timestamp: Utc::now(),
        }
    }
}
