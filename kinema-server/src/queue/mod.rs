//! Persistent priority queue and job state store.

pub mod job;
pub mod persist;
pub mod store;

pub use job::{JobStatus, TranscodeJob};
pub use persist::{load_state, save_state, QueueStateFile};
pub use store::{
    ActiveJob, EngineState, EnqueueOutcome, FailureOutcome, JobHandle, JobSignal,
    COMPLETED_HISTORY_LIMIT, MAX_RETRIES,
};
