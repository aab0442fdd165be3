//! Worker service construction.
//!
//! Translates a job's allocations into per-node service definitions and the
//! bollard specs to create them. Attributes are kept in [`WorkerService`] so
//! the monitor can recreate a failed service exactly as it was first built.

use crate::job::Job;
use crate::scheduler::ImageDomainConfig;
use bollard::models::{
    HealthConfig, Mount, MountTypeEnum, NetworkAttachmentConfig, ServiceSpec, ServiceSpecMode,
    ServiceSpecModeReplicated, TaskSpec, TaskSpecContainerSpec, TaskSpecPlacement,
    TaskSpecRestartPolicy, TaskSpecRestartPolicyConditionEnum,
};
use std::collections::HashMap;

// Healthcheck timings in nanoseconds, as the engine API expects.
const HEALTHCHECK_INTERVAL_NS: i64 = 500 * 1_000_000;
const HEALTHCHECK_TIMEOUT_NS: i64 = 6_000 * 1_000_000;
const HEALTHCHECK_START_PERIOD_NS: i64 = 6_000 * 1_000_000;
const HEALTHCHECK_RETRIES: i64 = 5;

/// A bind mount from a host directory into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host_dir: String,
    pub container_dir: String,
}

/// Everything needed to create (or recreate) one worker service.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerService {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    /// Hostname of the node this service is constrained to.
    pub constraint_host: String,
    pub mounts: Vec<MountSpec>,
    pub labels: HashMap<String, String>,
    pub network: String,
    pub cpus_allocated: u32,
}

impl WorkerService {
    /// Render the swarm service spec: placement constraint, labels, mounts,
    /// healthcheck, and an on-failure restart policy with bounded attempts.
    pub fn to_service_spec(&self, restart_max_attempts: u32) -> ServiceSpec {
        let mounts = self
            .mounts
            .iter()
            .map(|mount| Mount {
                source: Some(mount.host_dir.clone()),
                target: Some(mount.container_dir.clone()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            })
            .collect();

        let container_spec = TaskSpecContainerSpec {
            image: Some(self.image.clone()),
            command: Some(self.command.clone()),
            args: Some(self.args.clone()),
            mounts: Some(mounts),
            health_check: Some(HealthConfig {
                test: Some(vec!["CMD-SHELL".to_string(), "echo ok".to_string()]),
                interval: Some(HEALTHCHECK_INTERVAL_NS),
                timeout: Some(HEALTHCHECK_TIMEOUT_NS),
                retries: Some(HEALTHCHECK_RETRIES),
                start_period: Some(HEALTHCHECK_START_PERIOD_NS),
                ..Default::default()
            }),
            ..Default::default()
        };

        ServiceSpec {
            name: Some(self.name.clone()),
            labels: Some(self.labels.clone()),
            task_template: Some(TaskSpec {
                container_spec: Some(container_spec),
                restart_policy: Some(TaskSpecRestartPolicy {
                    condition: Some(TaskSpecRestartPolicyConditionEnum::ON_FAILURE),
                    max_attempts: Some(restart_max_attempts as i64),
                    ..Default::default()
                }),
                placement: Some(TaskSpecPlacement {
                    constraints: Some(vec![format!(
                        "node.hostname == {}",
                        self.constraint_host
                    )]),
                    ..Default::default()
                }),
                networks: Some(vec![NetworkAttachmentConfig {
                    target: Some(self.network.clone()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            mode: Some(ServiceSpecMode {
                replicated: Some(ServiceSpecModeReplicated { replicas: Some(1) }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Name of the service for one partition of a job.
pub fn service_name(basename: &str, index: usize, job_id: &str) -> String {
    format!("{basename}{index}_{job_id}")
}

/// Extract the job id from a worker service name.
pub fn job_id_from_service_name(name: &str) -> Option<&str> {
    name.split_once('_').map(|(_, job_id)| job_id)
}

/// Build the `"name0:cpus0,name1:cpus1,…"` host list handed to the rank-0
/// container, covering every partition of the job.
pub fn build_host_list(basename: &str, job: &Job) -> String {
    job.allocations
        .iter()
        .enumerate()
        .map(|(index, allocation)| {
            format!(
                "{}:{}",
                service_name(basename, index, &job.job_id),
                allocation.cpus_allocated
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Build service definitions for every allocation of a job.
///
/// Index 0 runs the model entrypoint with the host list as its argument;
/// the remaining indexes run only the SSH daemon so rank 0 can fan out MPI
/// work. Each service is pinned to its allocation's hostname and labeled
/// with the hostname and cpu count for later inspection.
pub fn build_worker_services(
    job: &Job,
    image: &str,
    domain_dir: &str,
    config: &ImageDomainConfig,
    basename: &str,
) -> Vec<WorkerService> {
    let host_list = build_host_list(basename, job);

    job.allocations
        .iter()
        .enumerate()
        .map(|(index, allocation)| {
            let host_dir = if index == 0 {
                domain_dir.to_string()
            } else {
                config.scratch_dir.clone()
            };
            let (command, args) = if index == 0 {
                (config.model_command.clone(), vec![host_list.clone()])
            } else {
                (config.ssh_command.clone(), Vec::new())
            };
            WorkerService {
                name: service_name(basename, index, &job.job_id),
                image: image.to_string(),
                command,
                args,
                constraint_host: allocation.hostname.clone(),
                mounts: vec![MountSpec {
                    host_dir,
                    container_dir: config.container_data_dir.clone(),
                }],
                labels: HashMap::from([
                    ("hostname".to_string(), allocation.hostname.clone()),
                    (
                        "cpus_allocated".to_string(),
                        allocation.cpus_allocated.to_string(),
                    ),
                    ("job_id".to_string(), job.job_id.clone()),
                ]),
                network: config.network.clone(),
                cpus_allocated: allocation.cpus_allocated,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SchedulerRequest;
    use crate::resource::{Allocation, AllocationParadigm};

    fn job_with_allocations(cpus: &[u32]) -> Job {
        let mut job = Job::new(SchedulerRequest {
            model_name: "NWM".to_string(),
            version: 2.0,
            output: "streamflow".to_string(),
            parameters: HashMap::new(),
            cpus: cpus.iter().sum(),
            memory: 500_000_000,
            allocation_paradigm: AllocationParadigm::FillNodes,
            config_data_id: None,
            session_secret: "secret".to_string(),
            user_id: "u1".to_string(),
        });
        job.allocations = cpus
            .iter()
            .enumerate()
            .map(|(index, &count)| Allocation {
                node_id: format!("node-{index}"),
                hostname: format!("host-{index}"),
                cpus_allocated: count,
                memory_allocated: 0,
                partition_index: index,
            })
            .collect();
        job
    }

    #[test]
    fn test_host_list_covers_all_partitions() {
        let job = job_with_allocations(&[18, 96, 36]);
        let host_list = build_host_list("maas-worker", &job);
        let expected = format!(
            "maas-worker0_{id}:18,maas-worker1_{id}:96,maas-worker2_{id}:36",
            id = job.job_id
        );
        assert_eq!(host_list, expected);
    }

    #[test]
    fn test_rank_zero_runs_model_others_run_sshd() {
        let job = job_with_allocations(&[4, 4]);
        let config = ImageDomainConfig::default();
        let services =
            build_worker_services(&job, "registry:5000/nwm:latest", "/data/croton", &config, "maas-worker");

        assert_eq!(services.len(), 2);
        assert_eq!(services[0].command, config.model_command);
        assert_eq!(services[0].args, vec![build_host_list("maas-worker", &job)]);
        assert_eq!(services[0].mounts[0].host_dir, "/data/croton");

        assert_eq!(services[1].command, config.ssh_command);
        assert!(services[1].args.is_empty());
        assert_eq!(services[1].mounts[0].host_dir, config.scratch_dir);
    }

    #[test]
    fn test_services_pinned_and_labeled() {
        let job = job_with_allocations(&[4, 8]);
        let config = ImageDomainConfig::default();
        let services =
            build_worker_services(&job, "img", "/data", &config, "maas-worker");

        for (index, service) in services.iter().enumerate() {
            assert_eq!(service.constraint_host, format!("host-{index}"));
            assert_eq!(service.labels["hostname"], format!("host-{index}"));
            assert_eq!(
                service.labels["cpus_allocated"],
                job.allocations[index].cpus_allocated.to_string()
            );
        }

        let spec = services[0].to_service_spec(2);
        let constraints = spec
            .task_template
            .as_ref()
            .and_then(|t| t.placement.as_ref())
            .and_then(|p| p.constraints.clone())
            .unwrap();
        assert_eq!(constraints, vec!["node.hostname == host-0".to_string()]);
    }

    #[test]
    fn test_job_id_parses_back_from_service_name() {
        let name = service_name("maas-worker", 1, "abc-123");
        assert_eq!(job_id_from_service_name(&name), Some("abc-123"));
        assert_eq!(job_id_from_service_name("no-underscore"), None);
    }
}
