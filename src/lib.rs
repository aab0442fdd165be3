//! # maasd
//!
//! Control plane for a Model-as-a-Service platform. Clients submit model
//! execution requests over authenticated websocket connections; the control
//! plane validates and authorizes them, allocates CPUs and memory across a
//! pool of worker nodes, dispatches containerized workers over the swarm
//! services API, and streams job lifecycle updates back to the originating
//! client.
//!
//! ## Architecture Overview
//!
//! The system is a trio of cooperating services built from these modules:
//!
//! - **[`handler`]**: the websocket request handler: session negotiation,
//!   typed message dispatch, and per-client job update streams
//! - **[`scheduler`]**: container dispatch and supervision: service
//!   creation, the monitor loop, and the scheduler's RPC endpoint
//! - **[`job`]** and **[`resource`]**: the job state machine and atomic
//!   multi-node resource allocation backing it
//! - **[`session`]**: authenticated session lifecycle
//! - **[`kv`]**: the gateway to the KV store where all durable state lives
//! - **[`model`]**: per-model validation records for submissions
//! - **[`client`]**: the RPC client the handler uses to reach a scheduler
//!   running in another process
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use maasd::job::JobManager;
//! use maasd::kv::{KeyNamespace, KvStore};
//! use maasd::resource::{Resource, ResourceManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = KvStore::in_memory();
//!     let keys = KeyNamespace::new("maas");
//!
//!     let resources = ResourceManager::new(store.clone(), keys.clone());
//!     resources
//!         .set_resources([Resource::new("node-01", "worker-a", 18, 33_548_128_256)])
//!         .await?;
//!
//!     let jobs = JobManager::new(store, keys, "maas", resources.clone());
//!     println!("active jobs: {:?}", jobs.get_ids(true).await?);
//!     Ok(())
//! }
//! ```

/// Key-value store gateway with redis and embedded backends.
pub mod kv;

/// Authenticated session management.
pub mod session;

/// Worker-node inventory, atomic allocation, and allocation policies.
pub mod resource;

/// Job records, state machine, and persistence.
pub mod job;

/// Model registry and request validation.
pub mod model;

/// Container dispatch and supervision.
pub mod scheduler;

/// Websocket request handler.
pub mod handler;

/// Scheduler RPC client.
pub mod client;

/// Environment constants and lookup helpers.
pub mod env;

// Re-export the main types at the crate root.
pub use client::{SchedulerApi, SchedulerClient};
pub use handler::{AuthOracle, PermissiveAuth, RequestHandler};
pub use job::{Job, JobManager, JobPhase, JobStatus, JobStep, SchedulerRequest};
pub use kv::{KeyNamespace, KvConfig, KvStore};
pub use model::ModelRegistry;
pub use resource::{Allocation, AllocationParadigm, Resource, ResourceManager};
pub use scheduler::{ImageDomainConfig, Scheduler, SchedulerConfig, SchedulerResponse};
pub use session::{Session, SessionManager, SessionManagerConfig};
