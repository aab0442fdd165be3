//! KV-backed resource manager.

use crate::kv::{KeyNamespace, KvStore};
use crate::resource::{Allocation, Resource, ResourceError, Result};
use tracing::{debug, info};

/// Conflict retries before an allocation attempt gives up. Contention on a
/// single node hash resolves quickly, so hitting this means something is
/// pathologically wrong.
const ALLOCATE_RETRY_LIMIT: u32 = 64;

/// Tracks worker-node inventory and performs atomic allocate/release.
#[derive(Clone)]
pub struct ResourceManager {
    store: KvStore,
    keys: KeyNamespace,
}

impl ResourceManager {
    pub fn new(store: KvStore, keys: KeyNamespace) -> Self {
        Self { store, keys }
    }

    fn node_key(&self, node_id: &str) -> String {
        self.keys.key(&["resource", node_id])
    }

    fn members_key(&self) -> String {
        self.keys.key(&["resources"])
    }

    fn order_key(&self) -> String {
        self.keys.key(&["resources", "order"])
    }

    /// Initialize the pool, replacing any prior registration. Registration
    /// order is preserved and drives policy iteration order.
    pub async fn set_resources(
        &self,
        resources: impl IntoIterator<Item = Resource>,
    ) -> Result<()> {
        self.store.delete(&self.order_key()).await?;
        for resource in resources {
            let node_key = self.node_key(&resource.node_id);
            let fields = resource.to_fields();
            let pairs: Vec<(&str, String)> = fields.iter().map(|(k, v)| (*k, v.clone())).collect();
            self.store.hash_set(&node_key, &pairs).await?;
            self.store.set_add(&self.members_key(), &resource.node_id).await?;
            self.store.list_push(&self.order_key(), &resource.node_id).await?;
            info!(node_id = %resource.node_id, cpus = resource.total_cpus, "registered resource");
        }
        Ok(())
    }

    /// Node ids in registration order.
    pub async fn get_resource_ids(&self) -> Result<Vec<String>> {
        Ok(self.store.list_range(&self.order_key()).await?)
    }

    /// Full metadata for every registered node, in registration order.
    pub async fn get_resources(&self) -> Result<Vec<Resource>> {
        let mut resources = Vec::new();
        for node_id in self.get_resource_ids().await? {
            if let Some(resource) = self.get_resource(&node_id).await? {
                resources.push(resource);
            }
        }
        Ok(resources)
    }

    /// Metadata for one node, or `None` when it is not registered.
    pub async fn get_resource(&self, node_id: &str) -> Result<Option<Resource>> {
        let fields = self.store.hash_get_all(&self.node_key(node_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Resource::from_fields(node_id, &fields)
            .map(Some)
            .ok_or_else(|| ResourceError::CorruptRecord(node_id.to_string()))
    }

    /// Attempt to allocate CPUs (and memory) from one node.
    ///
    /// Runs inside a watched transaction against the node's hash; on write
    /// conflict the attempt retries from the read. With `partial` set, takes
    /// whatever is available instead of the full request. Returns `None`
    /// without modifying anything when the node cannot satisfy the request
    /// (or has nothing available in partial mode).
    pub async fn allocate(
        &self,
        node_id: &str,
        requested_cpus: u32,
        requested_memory: u64,
        partial: bool,
    ) -> Result<Option<Allocation>> {
        if requested_cpus == 0 {
            return Err(ResourceError::InvalidCpuRequest(requested_cpus));
        }

        let node_key = self.node_key(node_id);
        for _ in 0..ALLOCATE_RETRY_LIMIT {
            let mut tx = self.store.watch(&[node_key.as_str()]).await?;
            let fields = tx.hash_get_all(&node_key).await?;
            if fields.is_empty() {
                tx.abort().await?;
                return Err(ResourceError::UnknownNode(node_id.to_string()));
            }
            let resource = Resource::from_fields(node_id, &fields)
                .ok_or_else(|| ResourceError::CorruptRecord(node_id.to_string()))?;

            if !resource.is_allocatable() {
                tx.abort().await?;
                return Ok(None);
            }

            let cpus_taken = if resource.available_cpus >= requested_cpus {
                requested_cpus
            } else if partial && resource.available_cpus > 0 {
                resource.available_cpus
            } else {
                debug!(
                    node_id,
                    requested = requested_cpus,
                    available = resource.available_cpus,
                    "insufficient cpus on node"
                );
                tx.abort().await?;
                return Ok(None);
            };
            // A partial grant charges memory in proportion to the cpus taken.
            let memory_scaled = if cpus_taken == requested_cpus {
                requested_memory
            } else {
                (requested_memory as u128 * cpus_taken as u128 / requested_cpus as u128) as u64
            };
            let memory_taken = memory_scaled.min(resource.available_memory);

            tx.stage()
                .hash_incr(&node_key, "available_cpus", -(cpus_taken as i64))
                .hash_incr(&node_key, "available_memory", -(memory_taken as i64));
            if tx.exec().await? {
                return Ok(Some(Allocation {
                    node_id: node_id.to_string(),
                    hostname: resource.hostname,
                    cpus_allocated: cpus_taken,
                    memory_allocated: memory_taken,
                    partition_index: 0,
                }));
            }
            debug!(node_id, "write conflict during allocation, retrying");
            tokio::task::yield_now().await;
        }
        Err(ResourceError::Store(crate::kv::KvError::RetriesExceeded(
            ALLOCATE_RETRY_LIMIT,
        )))
    }

    /// Return allocated counters to their nodes.
    ///
    /// Counters are clamped so a double release can never push availability
    /// past a node's totals.
    pub async fn release(&self, allocations: &[Allocation]) -> Result<()> {
        for allocation in allocations {
            let node_key = self.node_key(&allocation.node_id);
            for _ in 0..ALLOCATE_RETRY_LIMIT {
                let mut tx = self.store.watch(&[node_key.as_str()]).await?;
                let fields = tx.hash_get_all(&node_key).await?;
                if fields.is_empty() {
                    // Node left the pool; nothing to return counters to.
                    tx.abort().await?;
                    break;
                }
                let resource = Resource::from_fields(&allocation.node_id, &fields)
                    .ok_or_else(|| ResourceError::CorruptRecord(allocation.node_id.clone()))?;

                let cpus_back = allocation
                    .cpus_allocated
                    .min(resource.total_cpus.saturating_sub(resource.available_cpus));
                let memory_back = allocation
                    .memory_allocated
                    .min(resource.total_memory.saturating_sub(resource.available_memory));

                tx.stage()
                    .hash_incr(&node_key, "available_cpus", cpus_back as i64)
                    .hash_incr(&node_key, "available_memory", memory_back as i64);
                if tx.exec().await? {
                    debug!(
                        node_id = %allocation.node_id,
                        cpus = cpus_back,
                        "released allocation"
                    );
                    break;
                }
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }

    /// Sum of currently available CPUs across the pool. A hint only; nothing
    /// is reserved by reading it.
    pub async fn available_cpu_count(&self) -> Result<u32> {
        let mut total = 0;
        for resource in self.get_resources().await? {
            total += resource.available_cpus;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool(cpus: &[u32]) -> ResourceManager {
        let manager = ResourceManager::new(KvStore::in_memory(), KeyNamespace::new("test"));
        let resources = cpus.iter().enumerate().map(|(index, &count)| {
            Resource::new(
                format!("node-{index}"),
                format!("host-{index}"),
                count,
                1_000_000_000,
            )
        });
        manager.set_resources(resources).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_allocate_and_release_roundtrip() {
        let manager = pool(&[18]).await;
        let allocation = manager
            .allocate("node-0", 5, 500_000_000, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(allocation.cpus_allocated, 5);
        assert_eq!(
            manager.get_resource("node-0").await.unwrap().unwrap().available_cpus,
            13
        );

        manager.release(&[allocation]).await.unwrap();
        assert_eq!(
            manager.get_resource("node-0").await.unwrap().unwrap().available_cpus,
            18
        );
    }

    #[tokio::test]
    async fn test_allocate_insufficient_leaves_counters_untouched() {
        let manager = pool(&[4]).await;
        assert!(manager
            .allocate("node-0", 8, 0, false)
            .await
            .unwrap()
            .is_none());
        assert_eq!(manager.available_cpu_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_partial_allocation_takes_remainder() {
        let manager = pool(&[4]).await;
        let allocation = manager
            .allocate("node-0", 8, 0, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(allocation.cpus_allocated, 4);
        assert_eq!(manager.available_cpu_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_cpu_request_rejected_before_store() {
        let manager = pool(&[4]).await;
        assert!(matches!(
            manager.allocate("node-0", 0, 0, false).await,
            Err(ResourceError::InvalidCpuRequest(0))
        ));
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let manager = pool(&[4]).await;
        assert!(matches!(
            manager.allocate("node-9", 1, 0, false).await,
            Err(ResourceError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_never_oversubscribe() {
        let manager = pool(&[16]).await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.allocate("node-0", 3, 0, false).await.unwrap()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if let Some(allocation) = handle.await.unwrap() {
                granted += allocation.cpus_allocated;
            }
        }
        // 8 callers of 3 CPUs against 16: five fit, the rest are refused.
        assert_eq!(granted, 15);
        assert_eq!(manager.available_cpu_count().await.unwrap(), 16 - granted);
    }

    #[tokio::test]
    async fn test_double_release_is_clamped() {
        let manager = pool(&[18]).await;
        let allocation = manager
            .allocate("node-0", 5, 0, false)
            .await
            .unwrap()
            .unwrap();
        manager.release(std::slice::from_ref(&allocation)).await.unwrap();
        manager.release(&[allocation]).await.unwrap();
        assert_eq!(manager.available_cpu_count().await.unwrap(), 18);
    }
}
