//! Liveness record published for external observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, TaskId};
use super::job::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    #[default]
    Ready,
    Working,
}

/// Where the record lives: one entry per worker instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveryKey {
    pub service_name: String,
    pub instance_id: String,
}

/// The record itself.
///
/// Job fields keep the last job's identifiers until the next job overwrites
/// them; only `status` flips back to `ready` on resolution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRecord {
    pub status: WorkerStatus,
    pub job_id: Option<JobId>,
    pub task_id: Option<TaskId>,
    pub pipeline_name: Option<String>,
    pub algorithm_name: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DiscoveryRecord {
    pub fn new(algorithm_name: impl Into<String>) -> Self {
        Self {
            algorithm_name: algorithm_name.into(),
            ..Default::default()
        }
    }

    /// Merge a partial update; `None` fields keep their current value.
    pub fn merge(&mut self, update: DiscoveryUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(job_id) = update.job_id {
            self.job_id = Some(job_id);
        }
        if let Some(task_id) = update.task_id {
            self.task_id = Some(task_id);
        }
        if let Some(pipeline_name) = update.pipeline_name {
            self.pipeline_name = Some(pipeline_name);
        }
        if let Some(algorithm_name) = update.algorithm_name {
            self.algorithm_name = algorithm_name;
        }
        self.updated_at = Some(Utc::now());
    }
}

/// Partial record for `DiscoveryReporter::update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryUpdate {
    pub status: Option<WorkerStatus>,
    pub job_id: Option<JobId>,
    pub task_id: Option<TaskId>,
    pub pipeline_name: Option<String>,
    pub algorithm_name: Option<String>,
}

impl DiscoveryUpdate {
    pub fn job_started(job: &Job) -> Self {
        Self {
            status: Some(WorkerStatus::Working),
            job_id: Some(job.job_id.clone()),
            task_id: Some(job.task_id.clone()),
            pipeline_name: Some(job.pipeline_name.clone()),
            algorithm_name: None,
        }
    }

    pub fn status(status: WorkerStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_job_identifiers_until_overwritten() {
        let mut record = DiscoveryRecord::new("green-alg");
        let job = Job::new(JobId::new("j1"), TaskId::new("t1"), vec![]).with_pipeline("main");

        record.merge(DiscoveryUpdate::job_started(&job));
        assert_eq!(record.status, WorkerStatus::Working);
        assert_eq!(record.job_id, Some(JobId::new("j1")));

        record.merge(DiscoveryUpdate::status(WorkerStatus::Ready));
        assert_eq!(record.status, WorkerStatus::Ready);
        assert_eq!(record.job_id, Some(JobId::new("j1")));
        assert_eq!(record.pipeline_name.as_deref(), Some("main"));
        assert_eq!(record.algorithm_name, "green-alg");
        assert!(record.updated_at.is_some());
    }
}
