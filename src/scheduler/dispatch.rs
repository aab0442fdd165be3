//! Scheduler core: request intake and service dispatch.

use crate::job::{Job, JobManager, JobPhase, JobStatus, RsaKeyPair, SchedulerRequest};
use crate::resource::{allocate_for_request, ResourceManager};
use crate::scheduler::docker::DockerClient;
use crate::scheduler::service::{build_worker_services, WorkerService};
use crate::scheduler::{ImageDomainConfig, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Basename prefixing every worker service name.
    pub service_basename: String,
    /// Resource pool this scheduler serves.
    pub resource_pool: String,
    /// How often the monitor loop inspects service tasks.
    pub monitor_interval: Duration,
    /// Recreate attempts per service before the job is failed.
    pub restart_budget: u32,
    /// Directory holding per-job SSH key pairs.
    pub keys_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            service_basename: "maas-worker".to_string(),
            resource_pool: crate::env::DEFAULT_RESOURCE_POOL.to_string(),
            monitor_interval: Duration::from_secs(5),
            restart_budget: 2,
            keys_dir: PathBuf::from("/var/lib/maasd/keys"),
        }
    }
}

/// Reply to a scheduler request, also embedded in the client-facing
/// submission response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerResponse {
    pub success: bool,
    pub reason: String,
    pub message: String,
    pub job_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl SchedulerResponse {
    pub fn accepted(job_id: &str, data: serde_json::Value) -> Self {
        Self {
            success: true,
            reason: "ACCEPTED".to_string(),
            message: format!("job {job_id} scheduled"),
            job_id: job_id.to_string(),
            data,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: "REJECTED".to_string(),
            message: message.into(),
            job_id: "-1".to_string(),
            data: serde_json::Value::Null,
        }
    }

    fn progress(job_id: &str, reason: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            reason: reason.to_string(),
            message: message.into(),
            job_id: job_id.to_string(),
            data: serde_json::Value::Null,
        }
    }

    /// Whether this response terminates a request/response exchange (as
    /// opposed to a progress update in a streamed exchange).
    pub fn is_final(&self) -> bool {
        matches!(self.reason.as_str(), "ACCEPTED" | "REJECTED")
    }
}

/// A service the monitor is responsible for, with the attributes needed to
/// recreate it.
#[derive(Debug, Clone)]
pub(crate) struct MonitoredService {
    pub(crate) job_id: String,
    pub(crate) spec: WorkerService,
    pub(crate) restarts: u32,
}

/// Dispatches jobs to the container engine and supervises them.
pub struct Scheduler {
    pub(crate) docker: DockerClient,
    pub(crate) images: ImageDomainConfig,
    pub(crate) resources: ResourceManager,
    pub(crate) jobs: JobManager,
    pub(crate) config: SchedulerConfig,
    /// Service name to captured attributes, for restart on failure.
    pub(crate) monitored: DashMap<String, MonitoredService>,
}

impl Scheduler {
    pub fn new(
        docker: DockerClient,
        images: ImageDomainConfig,
        resources: ResourceManager,
        jobs: JobManager,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            docker,
            images,
            resources,
            jobs,
            config,
            monitored: DashMap::new(),
        })
    }

    /// Handle one scheduler request end to end: create the job record,
    /// allocate resources, dispatch worker services, and report the result.
    /// Failures are folded into the response rather than returned as errors.
    pub async fn handle_request(&self, request: SchedulerRequest) -> SchedulerResponse {
        self.handle_request_with_updates(request, None).await
    }

    /// Like [`handle_request`](Self::handle_request) but emits progress
    /// responses on `updates` as the job advances, for streamed RPC
    /// exchanges.
    pub async fn handle_request_with_updates(
        &self,
        request: SchedulerRequest,
        updates: Option<mpsc::Sender<SchedulerResponse>>,
    ) -> SchedulerResponse {
        let mut job = match self.jobs.create(request).await {
            Ok(job) => job,
            Err(err) => {
                error!("failed to create job record: {err}");
                return SchedulerResponse::rejected(format!("could not create job: {err}"));
            }
        };

        match self.allocate_and_dispatch(&mut job, updates).await {
            Ok(response) => response,
            Err(err) => {
                warn!(job_id = %job.job_id, "scheduling failed: {err}");
                if let Err(transition_err) = self
                    .jobs
                    .transition(&job.job_id, JobStatus::new(JobPhase::Failed))
                    .await
                {
                    error!(
                        job_id = %job.job_id,
                        "could not mark job failed: {transition_err}"
                    );
                }
                SchedulerResponse::rejected(format!("scheduling failed: {err}"))
            }
        }
    }

    async fn allocate_and_dispatch(
        &self,
        job: &mut Job,
        updates: Option<mpsc::Sender<SchedulerResponse>>,
    ) -> Result<SchedulerResponse> {
        let request = job.originating_request.clone();

        job.status = JobStatus::new(JobPhase::AwaitingAllocation);
        self.jobs.save(job).await?;

        let allocations = match allocate_for_request(
            &self.resources,
            request.allocation_paradigm,
            request.cpus,
            request.memory,
        )
        .await
        {
            Ok(Some(allocations)) => allocations,
            Ok(None) => {
                // Leave the job queued in AWAITING_ALLOCATION; tell the
                // client whether waiting could ever succeed.
                let pool_total: u32 = self
                    .resources
                    .get_resources()
                    .await?
                    .iter()
                    .map(|resource| resource.total_cpus)
                    .sum();
                let hint = if request.cpus <= pool_total {
                    "the pool could satisfy this request later; queuing is possible"
                } else {
                    // An impossible request will never leave the queue.
                    self.jobs
                        .transition(&job.job_id, JobStatus::new(JobPhase::Failed))
                        .await?;
                    "the request exceeds total pool capacity and can never be satisfied"
                };
                return Ok(SchedulerResponse::rejected(format!(
                    "insufficient resources for {} cpus: {hint}",
                    request.cpus
                )));
            }
            // Invalid requests fail the job outright via the error path.
            Err(err) => return Err(err.into()),
        };

        job.allocations = allocations;
        job.status = JobStatus::new(JobPhase::AwaitingScheduling);
        if job.allocations.len() > 1 {
            let key_pair = RsaKeyPair::new(self.config.keys_dir.join(&job.job_id));
            key_pair.ensure_generated()?;
            job.rsa_key_pair = Some(key_pair);
        }
        self.jobs.save(job).await?;
        if let Some(updates) = &updates {
            let _ = updates
                .send(SchedulerResponse::progress(
                    &job.job_id,
                    "ALLOCATED",
                    format!("{} cpus allocated across {} nodes", job.allocated_cpus(), job.allocations.len()),
                ))
                .await;
        }

        self.dispatch_services(job).await?;

        job.status = JobStatus::new(JobPhase::Running);
        self.jobs.save(job).await?;
        info!(
            job_id = %job.job_id,
            services = job.allocations.len(),
            "job dispatched"
        );

        Ok(SchedulerResponse::accepted(
            &job.job_id,
            json!({ "allocations": job.allocations }),
        ))
    }

    /// Create every worker service for the job, tearing down any partial
    /// set on failure.
    pub(crate) async fn dispatch_services(&self, job: &Job) -> Result<()> {
        let request = &job.originating_request;
        let (image, domain_dir) = self
            .images
            .select(&request.model_name, request.config_data_id.as_deref())?;
        let services = build_worker_services(
            job,
            &image,
            &domain_dir,
            &self.images,
            &self.config.service_basename,
        );

        let mut created: Vec<String> = Vec::new();
        for service in &services {
            let spec = service.to_service_spec(self.config.restart_budget);
            if let Err(err) = self.docker.create_service(spec).await {
                error!(service = %service.name, "service creation failed: {err}");
                for name in &created {
                    if let Err(cleanup_err) = self.docker.remove_service(name).await {
                        warn!(service = %name, "cleanup failed: {cleanup_err}");
                    }
                    self.monitored.remove(name);
                }
                return Err(err);
            }
            created.push(service.name.clone());
            self.monitored.insert(
                service.name.clone(),
                MonitoredService {
                    job_id: job.job_id.clone(),
                    spec: service.clone(),
                    restarts: 0,
                },
            );
        }
        Ok(())
    }
}
