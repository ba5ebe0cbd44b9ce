//! Job lifecycle state and the status written to the coordination store.

use serde::{Deserialize, Serialize};

use super::errors::WorkerError;

/// Lifecycle state of one delivered job.
///
/// State transitions:
/// - Queued -> Active (dequeued by this worker)
/// - Active -> Succeeded | Failed | Stopped (exactly once)
///
/// Stopped is only reachable through an external stop notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Succeeded,
    Failed,
    Stopped,
}

impl JobState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Stopped
        )
    }

    /// Validate and apply a transition.
    pub fn transition(self, next: JobState) -> Result<JobState, WorkerError> {
        let allowed = match self {
            JobState::Queued => next == JobState::Active,
            JobState::Active => next.is_terminal(),
            JobState::Succeeded | JobState::Failed | JobState::Stopped => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(WorkerError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Wire status for this state, if the state is ever published.
    pub fn task_status(self) -> Option<TaskStatus> {
        match self {
            JobState::Queued => None,
            JobState::Active => Some(TaskStatus::Active),
            JobState::Succeeded => Some(TaskStatus::Succeed),
            JobState::Failed => Some(TaskStatus::Failed),
            JobState::Stopped => Some(TaskStatus::Stopped),
        }
    }
}

/// Task status as stored under the task key.
///
/// We serialize in lower case to match what pipeline drivers read:
/// `active` / `succeed` / `failed` / `stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Succeed,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::dequeue(JobState::Queued, JobState::Active)]
    #[case::succeed(JobState::Active, JobState::Succeeded)]
    #[case::fail(JobState::Active, JobState::Failed)]
    #[case::stop(JobState::Active, JobState::Stopped)]
    fn allowed_transitions(#[case] from: JobState, #[case] to: JobState) {
        assert_eq!(from.transition(to).unwrap(), to);
    }

    #[rstest]
    #[case::skip_active(JobState::Queued, JobState::Succeeded)]
    #[case::reactivate(JobState::Active, JobState::Active)]
    #[case::after_success(JobState::Succeeded, JobState::Failed)]
    #[case::after_stop(JobState::Stopped, JobState::Succeeded)]
    #[case::after_failure(JobState::Failed, JobState::Active)]
    fn rejected_transitions(#[case] from: JobState, #[case] to: JobState) {
        let err = from.transition(to).unwrap_err();
        assert!(matches!(err, WorkerError::InvalidTransition { .. }));
    }

    #[test]
    fn task_status_serializes_as_wire_names() {
        let s = serde_json::to_string(&TaskStatus::Succeed).unwrap();
        assert_eq!(s, "\"succeed\"");
        assert_eq!(JobState::Failed.task_status(), Some(TaskStatus::Failed));
        assert_eq!(JobState::Queued.task_status(), None);
        assert!(!TaskStatus::Active.is_terminal());
    }
}
