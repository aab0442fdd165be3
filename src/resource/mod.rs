//! Worker-node inventory and resource allocation.
//!
//! Tracks the compute pool (CPUs and memory per node) in the KV store and
//! exposes atomic allocate/release operations plus the allocation policies
//! built on top of them. Per-node mutations run inside watched transactions,
//! so concurrent allocators never oversubscribe a node; multi-node policies
//! roll back partial acquisitions when the overall request cannot be met.

mod manager;
mod policy;
mod types;

pub use manager::ResourceManager;
pub use policy::{allocate_for_request, AllocationParadigm};
pub use types::{Allocation, Resource, ResourceAvailability, ResourceState};

/// Resource subsystem errors.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// KV gateway failure
    #[error("resource store error: {0}")]
    Store(#[from] crate::kv::KvError),

    /// The referenced node is not registered
    #[error("unknown resource node: {0}")]
    UnknownNode(String),

    /// Zero or otherwise unusable cpu request
    #[error("invalid cpu request: {0}")]
    InvalidCpuRequest(u32),

    /// A persisted record was missing fields or unparseable
    #[error("corrupt resource record for node {0}")]
    CorruptRecord(String),
}

/// Result type for resource operations.
pub type Result<T> = std::result::Result<T, ResourceError>;
