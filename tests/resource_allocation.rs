//! Allocation scenarios across the policy layer.

use maasd::kv::{KeyNamespace, KvStore};
use maasd::resource::{allocate_for_request, AllocationParadigm, Resource, ResourceManager};

async fn pool(cpus: &[u32]) -> ResourceManager {
    let manager = ResourceManager::new(KvStore::in_memory(), KeyNamespace::new("maas"));
    let resources = cpus.iter().enumerate().map(|(index, &count)| {
        Resource::new(
            format!("node-{index:04}"),
            format!("worker-{index}"),
            count,
            64_000_000_000,
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
async fn single_node_allocate_and_release() {
    let pool = pool(&[18]).await;

    let allocation = pool
        .allocate("node-0000", 5, 500_000_000, false)
        .await
        .unwrap()
        .expect("allocation should succeed");
    assert_eq!(allocation.cpus_allocated, 5);
    assert_eq!(available(&pool).await, vec![13]);

    pool.release(&[allocation]).await.unwrap();
    assert_eq!(available(&pool).await, vec![18]);
}

#[tokio::test]
async fn round_robin_with_insufficient_capacity_changes_nothing() {
    let pool = pool(&[8, 96, 96]).await;

    // 25 CPUs round-robin needs 9 from the first node, which has only 8.
    let outcome = allocate_for_request(&pool, AllocationParadigm::RoundRobin, 25, 0)
        .await
        .unwrap();
    assert!(outcome.is_none());
    assert_eq!(available(&pool).await, vec![8, 96, 96]);
}

#[tokio::test]
async fn fill_nodes_drains_in_registration_order() {
    let pool = pool(&[18, 96, 96]).await;

    let allocations = allocate_for_request(&pool, AllocationParadigm::FillNodes, 150, 0)
        .await
        .unwrap()
        .expect("pool has 210 CPUs available");
    let taken: Vec<u32> = allocations
        .iter()
        .map(|allocation| allocation.cpus_allocated)
        .collect();
    assert_eq!(taken, vec![18, 96, 36]);
    assert_eq!(available(&pool).await, vec![0, 0, 60]);

    // Partition indexes follow the allocation order.
    let indexes: Vec<usize> = allocations
        .iter()
        .map(|allocation| allocation.partition_index)
        .collect();
    assert_eq!(indexes, vec![0, 1, 2]);
}

#[tokio::test]
async fn nodes_never_go_negative_under_concurrency() {
    let pool = pool(&[16]).await;

    let mut handles = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.allocate("node-0000", 5, 0, false).await.unwrap()
        }));
    }
    let granted: u32 = {
        let mut sum = 0;
        for handle in handles {
            if let Some(allocation) = handle.await.unwrap() {
                sum += allocation.cpus_allocated;
            }
        }
        sum
    };

    assert_eq!(granted, 15);
    let remaining = available(&pool).await[0];
    assert_eq!(remaining, 1);
}
