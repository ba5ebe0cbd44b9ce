//! Domain model (IDs, job payload, lifecycle state, outcomes, discovery record).

pub mod discovery;
pub mod errors;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod state;

pub use self::discovery::{DiscoveryKey, DiscoveryRecord, DiscoveryUpdate, WorkerStatus};
pub use self::errors::{ExecutionError, WorkerError};
pub use self::ids::{JobId, TaskId};
pub use self::job::{ExtraData, Job};
pub use self::outcome::{JobEvent, Resolution, ResolutionSource, TaskStateUpdate};
pub use self::state::{JobState, TaskStatus};
