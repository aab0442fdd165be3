//! Job records, lifecycle state machine, and persistence.
//!
//! A job is one end-to-end model execution request. Records live in the KV
//! store; saves are serialized per job through watched compare-and-swap on
//! the record, with conflicting writers merged through the state machine's
//! transition rules. Terminal transitions release the job's resource
//! allocations and delete its SSH key material.

mod manager;
mod rsa_key_pair;
mod types;

pub use manager::{JobManager, OpOutcome};
pub use rsa_key_pair::RsaKeyPair;
pub use types::{is_valid_transition, Job, JobPhase, JobStatus, JobStep, SchedulerRequest};

/// Job subsystem errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// KV gateway failure
    #[error("job store error: {0}")]
    Store(#[from] crate::kv::KvError),

    /// Resource manager failure during allocate/release coordination
    #[error("resource error: {0}")]
    Resource(#[from] crate::resource::ResourceError),

    /// No job exists with the given id
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// The requested status change is not permitted by the state machine
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// A concurrent writer changed the record and the caller's intent no
    /// longer applies
    #[error("conflicting concurrent update for job {0}")]
    ConflictingUpdate(String),

    /// SSH key pair generation or cleanup failed
    #[error("key pair error: {0}")]
    KeyPair(String),

    /// A persisted record was missing fields or unparseable
    #[error("corrupt job record for id {0}")]
    CorruptRecord(String),
}

/// Result type for job operations.
pub type Result<T> = std::result::Result<T, JobError>;
