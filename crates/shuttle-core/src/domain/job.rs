//! Job payload as delivered by the queue broker.

use serde::{Deserialize, Serialize};

use super::errors::WorkerError;
use super::ids::{JobId, TaskId};

/// One unit of work.
///
/// Immutable after arrival; lifecycle tracking lives in the per-job context,
/// not here. Field aliases cover the older snake_case / upper-case payloads
/// that some producers still send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(alias = "jobID")]
    pub job_id: JobId,

    pub task_id: TaskId,

    #[serde(default, alias = "pipeline_name")]
    pub pipeline_name: String,

    /// Node / algorithm label inside the pipeline.
    #[serde(default, alias = "nodeName")]
    pub node: String,

    #[serde(default)]
    pub input: Vec<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<ExtraData>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtraData {
    /// Source lines of caller-supplied code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Vec<String>>,
}

impl Job {
    pub fn new(job_id: JobId, task_id: TaskId, input: Vec<serde_json::Value>) -> Self {
        Self {
            job_id,
            task_id,
            pipeline_name: String::new(),
            node: String::new(),
            input,
            batch_index: None,
            extra_data: None,
        }
    }

    pub fn with_pipeline(mut self, pipeline_name: impl Into<String>) -> Self {
        self.pipeline_name = pipeline_name.into();
        self
    }

    pub fn with_code<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let code = lines.into_iter().map(Into::into).collect();
        self.extra_data = Some(ExtraData { code: Some(code) });
        self
    }

    /// Embedded code, if the job carries any non-empty source.
    pub fn code(&self) -> Option<&[String]> {
        self.extra_data
            .as_ref()
            .and_then(|extra| extra.code.as_deref())
            .filter(|lines| lines.iter().any(|line| !line.trim().is_empty()))
    }

    /// Decode a broker payload.
    pub fn from_payload(payload: serde_json::Value) -> Result<Self, WorkerError> {
        let job: Job = serde_json::from_value(payload)
            .map_err(|e| WorkerError::InvalidJob(format!("json decode: {e}")))?;
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.job_id.is_empty() {
            return Err(WorkerError::InvalidJob("jobId is empty".to_string()));
        }
        if self.task_id.is_empty() {
            return Err(WorkerError::InvalidJob("taskId is empty".to_string()));
        }
        Ok(())
    }
}
