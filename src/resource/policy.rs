//! Allocation policies.
//!
//! Each policy composes the per-node atomic `allocate` into a multi-node
//! strategy. Nodes are visited in registration order, and any partial
//! acquisition is rolled back when the overall request cannot be met, so a
//! failed policy run never leaks resources.

use crate::resource::{Allocation, ResourceError, ResourceManager, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Strategy used to spread a job's cpu request across the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationParadigm {
    /// First node that fits the whole request.
    SingleNode,
    /// Spread evenly across every node; each per-node slice must fit exactly.
    RoundRobin,
    /// Greedily drain nodes until the request is met.
    FillNodes,
}

impl Default for AllocationParadigm {
    fn default() -> Self {
        AllocationParadigm::SingleNode
    }
}

impl std::fmt::Display for AllocationParadigm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationParadigm::SingleNode => write!(f, "single-node"),
            AllocationParadigm::RoundRobin => write!(f, "round-robin"),
            AllocationParadigm::FillNodes => write!(f, "fill-nodes"),
        }
    }
}

impl std::str::FromStr for AllocationParadigm {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "single-node" => Ok(AllocationParadigm::SingleNode),
            "round-robin" => Ok(AllocationParadigm::RoundRobin),
            "fill-nodes" => Ok(AllocationParadigm::FillNodes),
            other => Err(format!("unknown allocation paradigm: {other}")),
        }
    }
}

/// Allocate `cpus` and `memory` across the pool using the given paradigm.
///
/// Returns `None` when the pool cannot satisfy the request; in that case no
/// counters were changed (partial acquisitions are released). Allocations in
/// the returned list carry their partition index.
pub async fn allocate_for_request(
    manager: &ResourceManager,
    paradigm: AllocationParadigm,
    cpus: u32,
    memory: u64,
) -> Result<Option<Vec<Allocation>>> {
    if cpus == 0 {
        return Err(ResourceError::InvalidCpuRequest(cpus));
    }
    let outcome = match paradigm {
        AllocationParadigm::SingleNode => single_node(manager, cpus, memory).await?,
        AllocationParadigm::RoundRobin => round_robin(manager, cpus, memory).await?,
        AllocationParadigm::FillNodes => fill_nodes(manager, cpus, memory).await?,
    };
    if let Some(allocations) = &outcome {
        info!(
            %paradigm,
            cpus,
            nodes = allocations.len(),
            "allocation complete"
        );
    }
    Ok(outcome)
}

/// The memory share for a slice of `cpus_taken` out of `cpus_total`.
fn memory_share(memory: u64, cpus_taken: u32, cpus_total: u32) -> u64 {
    (memory as u128 * cpus_taken as u128 / cpus_total as u128) as u64
}

async fn single_node(
    manager: &ResourceManager,
    cpus: u32,
    memory: u64,
) -> Result<Option<Vec<Allocation>>> {
    for node_id in manager.get_resource_ids().await? {
        if let Some(mut allocation) = manager.allocate(&node_id, cpus, memory, false).await? {
            allocation.partition_index = 0;
            return Ok(Some(vec![allocation]));
        }
    }
    debug!(cpus, "no single node can fit the request");
    Ok(None)
}

async fn round_robin(
    manager: &ResourceManager,
    cpus: u32,
    memory: u64,
) -> Result<Option<Vec<Allocation>>> {
    let node_ids = manager.get_resource_ids().await?;
    if node_ids.is_empty() {
        return Ok(None);
    }
    let node_count = node_ids.len() as u32;
    let base = cpus / node_count;
    let remainder = cpus % node_count;

    let mut acquired = Vec::new();
    for (index, node_id) in node_ids.iter().enumerate() {
        let want = base + u32::from((index as u32) < remainder);
        if want == 0 {
            continue;
        }
        // Each slice must be granted exactly; a short node fails the run.
        match manager
            .allocate(node_id, want, memory_share(memory, want, cpus), false)
            .await?
        {
            Some(mut allocation) => {
                allocation.partition_index = acquired.len();
                acquired.push(allocation);
            }
            None => {
                debug!(node_id = %node_id, want, "round-robin slice unavailable, rolling back");
                manager.release(&acquired).await?;
                return Ok(None);
            }
        }
    }
    Ok(Some(acquired))
}

async fn fill_nodes(
    manager: &ResourceManager,
    cpus: u32,
    memory: u64,
) -> Result<Option<Vec<Allocation>>> {
    let mut acquired: Vec<Allocation> = Vec::new();
    let mut remaining = cpus;

    for node_id in manager.get_resource_ids().await? {
        if remaining == 0 {
            break;
        }
        let memory_wanted = memory_share(memory, remaining, cpus);
        if let Some(mut allocation) = manager
            .allocate(&node_id, remaining, memory_wanted, true)
            .await?
        {
            if allocation.cpus_allocated == 0 {
                continue;
            }
            remaining -= allocation.cpus_allocated;
            allocation.partition_index = acquired.len();
            acquired.push(allocation);
        }
    }

    if remaining > 0 {
        debug!(
            requested = cpus,
            short_by = remaining,
            "fill-nodes could not reach the total, rolling back"
        );
        manager.release(&acquired).await?;
        return Ok(None);
    }
    Ok(Some(acquired))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KeyNamespace, KvStore};
    use crate::resource::Resource;

    async fn pool(cpus: &[u32]) -> ResourceManager {
        let manager = ResourceManager::new(KvStore::in_memory(), KeyNamespace::new("test"));
        let resources = cpus.iter().enumerate().map(|(index, &count)| {
            Resource::new(
                format!("node-{index}"),
                format!("host-{index}"),
                count,
                8_000_000_000,
            )
        });
        manager.set_resources(resources).await.unwrap();
        manager
    }

    async fn available(manager: &ResourceManager) -> Vec<u32> {
        manager
            .get_resources()
            .await
            .unwrap()
            .iter()
            .map(|resource| resource.available_cpus)
            .collect()
    }

    #[tokio::test]
    async fn test_single_node_takes_first_fit() {
        let manager = pool(&[4, 18, 96]).await;
        let allocations =
            allocate_for_request(&manager, AllocationParadigm::SingleNode, 10, 0)
                .await
                .unwrap()
                .unwrap();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].node_id, "node-1");
        assert_eq!(available(&manager).await, vec![4, 8, 96]);
    }

    #[tokio::test]
    async fn test_round_robin_spreads_with_remainder() {
        let manager = pool(&[8, 96, 96]).await;
        let allocations =
            allocate_for_request(&manager, AllocationParadigm::RoundRobin, 10, 0)
                .await
                .unwrap()
                .unwrap();
        let cpus: Vec<u32> = allocations.iter().map(|a| a.cpus_allocated).collect();
        assert_eq!(cpus, vec![4, 3, 3]);
        assert_eq!(available(&manager).await, vec![4, 93, 93]);
    }

    #[tokio::test]
    async fn test_round_robin_insufficient_rolls_back() {
        let manager = pool(&[8, 96, 96]).await;
        // 25 across 3 nodes needs 9 from the first, which only has 8.
        let outcome = allocate_for_request(&manager, AllocationParadigm::RoundRobin, 25, 0)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(available(&manager).await, vec![8, 96, 96]);
    }

    #[tokio::test]
    async fn test_fill_nodes_drains_in_order() {
        let manager = pool(&[18, 96, 96]).await;
        let allocations =
            allocate_for_request(&manager, AllocationParadigm::FillNodes, 150, 0)
                .await
                .unwrap()
                .unwrap();
        let cpus: Vec<u32> = allocations.iter().map(|a| a.cpus_allocated).collect();
        assert_eq!(cpus, vec![18, 96, 36]);
        assert_eq!(available(&manager).await, vec![0, 0, 60]);
    }

    #[tokio::test]
    async fn test_fill_nodes_short_pool_rolls_back() {
        let manager = pool(&[18, 20]).await;
        let outcome = allocate_for_request(&manager, AllocationParadigm::FillNodes, 100, 0)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(available(&manager).await, vec![18, 20]);
    }

    #[tokio::test]
    async fn test_zero_request_rejected() {
        let manager = pool(&[18]).await;
        assert!(matches!(
            allocate_for_request(&manager, AllocationParadigm::SingleNode, 0, 0).await,
            Err(ResourceError::InvalidCpuRequest(0))
        ));
        assert_eq!(available(&manager).await, vec![18]);
    }

    #[tokio::test]
    async fn test_memory_shares_sum_to_request() {
        let manager = pool(&[18, 96, 96]).await;
        let allocations =
            allocate_for_request(&manager, AllocationParadigm::FillNodes, 150, 1_500_000)
                .await
                .unwrap()
                .unwrap();
        let total: u64 = allocations.iter().map(|a| a.memory_allocated).sum();
        assert_eq!(total, 1_500_000);
    }

    #[tokio::test]
    async fn test_paradigm_string_roundtrip() {
        for paradigm in [
            AllocationParadigm::SingleNode,
            AllocationParadigm::RoundRobin,
            AllocationParadigm::FillNodes,
        ] {
            assert_eq!(paradigm.to_string().parse(), Ok(paradigm));
        }
    }
}
