//! Worker node and allocation records.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Whether a node accepts new allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceAvailability {
    Active,
    Drained,
}

/// Observed node health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Ready,
    Down,
}

/// A worker node in the compute pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub node_id: String,
    pub hostname: String,
    pub availability: ResourceAvailability,
    pub state: ResourceState,
    pub total_cpus: u32,
    pub available_cpus: u32,
    pub total_memory: u64,
    pub available_memory: u64,
}

impl Resource {
    /// A freshly registered node with its full capacity available.
    pub fn new(
        node_id: impl Into<String>,
        hostname: impl Into<String>,
        cpus: u32,
        memory: u64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            availability: ResourceAvailability::Active,
            state: ResourceState::Ready,
            total_cpus: cpus,
            available_cpus: cpus,
            total_memory: memory,
            available_memory: memory,
        }
    }

    /// Whether the node can currently be allocated from.
    pub fn is_allocatable(&self) -> bool {
        self.availability == ResourceAvailability::Active && self.state == ResourceState::Ready
    }

    /// Serialize to the persisted hash field layout.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let availability = match self.availability {
            ResourceAvailability::Active => "active",
            ResourceAvailability::Drained => "drained",
        };
        let state = match self.state {
            ResourceState::Ready => "ready",
            ResourceState::Down => "down",
        };
        vec![
            ("hostname", self.hostname.clone()),
            ("availability", availability.to_string()),
            ("state", state.to_string()),
            ("total_cpus", self.total_cpus.to_string()),
            ("available_cpus", self.available_cpus.to_string()),
            ("total_memory", self.total_memory.to_string()),
            ("available_memory", self.available_memory.to_string()),
        ]
    }

    /// Reconstruct from the persisted hash field layout.
    pub fn from_fields(node_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let availability = match fields.get("availability")?.as_str() {
            "active" => ResourceAvailability::Active,
            "drained" => ResourceAvailability::Drained,
            _ => return None,
        };
        let state = match fields.get("state")?.as_str() {
            "ready" => ResourceState::Ready,
            "down" => ResourceState::Down,
            _ => return None,
        };
        Some(Self {
            node_id: node_id.to_string(),
            hostname: fields.get("hostname")?.clone(),
            availability,
            state,
            total_cpus: fields.get("total_cpus")?.parse().ok()?,
            available_cpus: fields.get("available_cpus")?.parse().ok()?,
            total_memory: fields.get("total_memory")?.parse().ok()?,
            available_memory: fields.get("available_memory")?.parse().ok()?,
        })
    }
}

/// A reservation of CPUs and memory on one node, owned by exactly one job
/// until released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub node_id: String,
    pub hostname: String,
    pub cpus_allocated: u32,
    pub memory_allocated: u64,
    /// Zero-based position within the owning job's allocation list.
    pub partition_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_field_roundtrip() {
        let resource = Resource::new("node-01", "worker-a", 18, 33_548_128_256);
        let fields: HashMap<String, String> = resource
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(Resource::from_fields("node-01", &fields), Some(resource));
    }

    #[test]
    fn test_drained_node_not_allocatable() {
        let mut resource = Resource::new("node-01", "worker-a", 18, 1024);
        assert!(resource.is_allocatable());
        resource.availability = ResourceAvailability::Drained;
        assert!(!resource.is_allocatable());
    }
}
