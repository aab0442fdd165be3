//! Container dispatch and supervision.
//!
//! Turns a job with a finalized allocation into one swarm service per
//! allocation, pinned to its node: the rank-0 service runs the model
//! entrypoint with the job's host list as arguments, the remaining services
//! run only the SSH daemon so rank 0 can fan MPI work out. A monitor loop
//! watches task states, recreates failed services up to a restart budget,
//! and drives jobs to COMPLETED or FAILED. A websocket RPC endpoint accepts
//! scheduler requests from the request handler when the two run as separate
//! processes.

mod dispatch;
mod docker;
mod images;
mod monitor;
mod remote;
mod service;

pub use dispatch::{Scheduler, SchedulerConfig, SchedulerResponse};
pub use docker::DockerClient;
pub use images::ImageDomainConfig;
pub use remote::serve_scheduler_rpc;
pub use service::{build_host_list, build_worker_services, MountSpec, WorkerService};

/// Scheduler subsystem errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Container engine API error
    #[error("container API error: {0}")]
    Api(#[from] bollard::errors::Error),

    /// Job manager failure
    #[error("job error: {0}")]
    Job(#[from] crate::job::JobError),

    /// Resource manager failure
    #[error("resource error: {0}")]
    Resource(#[from] crate::resource::ResourceError),

    /// Bad or missing scheduler configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Could not reach the container engine
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// IO error (config files, key material)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
