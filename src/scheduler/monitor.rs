//! Service supervision loop.
//!
//! Periodically enumerates the worker services this scheduler owns, reads
//! their task states, and acts on them: completed services are removed (the
//! job moves to COMPLETED once all of its services are done), failed ones
//! are removed and recreated from their captured attributes until the
//! restart budget is exhausted, at which point the job is failed and its
//! allocations released. Stop requests tear services down and mark the job
//! stopped. Services found running without captured attributes (a prior
//! monitor died) are re-captured from their live specs, so a fresh monitor
//! takes over where the old one left off.

use crate::job::{JobPhase, JobStatus, JobStep};
use crate::scheduler::dispatch::{MonitoredService, Scheduler};
use crate::scheduler::service::{job_id_from_service_name, MountSpec, WorkerService};
use crate::scheduler::Result;
use bollard::models::{Service, TaskState};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl Scheduler {
    /// Spawn the monitor loop as a background task.
    pub fn spawn_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.monitor_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = scheduler.monitor_pass().await {
                    error!("monitor pass failed: {err}");
                }
            }
        })
    }

    /// One pass over every owned service.
    pub async fn monitor_pass(&self) -> Result<()> {
        let services = self
            .docker
            .list_services_with_prefix(&self.config.service_basename)
            .await?;

        // Per-job view of what is still out there.
        let mut live_jobs: HashMap<String, Vec<String>> = HashMap::new();
        for service in &services {
            if let Some((name, job_id)) = identify(service) {
                live_jobs.entry(job_id.to_string()).or_default().push(name.to_string());
            }
        }

        let mut completed_services: HashSet<String> = HashSet::new();
        for service in &services {
            let Some((name, job_id)) = identify(service) else {
                continue;
            };
            let name = name.to_string();
            let job_id = job_id.to_string();
            let Some(service_id) = service.id.clone() else {
                continue;
            };

            self.take_over_if_unknown(&name, &job_id, service);

            if self.handle_stop_request(&job_id, &live_jobs).await? {
                continue;
            }

            let states = self.docker.service_task_states(&service_id).await?;
            let Some(state) = decisive_state(&states) else {
                continue;
            };

            match state {
                TaskState::COMPLETE => {
                    info!(service = %name, job_id = %job_id, "service complete");
                    self.docker.remove_service(&name).await?;
                    self.monitored.remove(&name);
                    // The SSH-daemon ranks exist only to serve rank 0, so
                    // its completion finishes the whole job.
                    if is_rank_zero(&name, &self.config.service_basename) {
                        for sibling in live_jobs.get(&job_id).into_iter().flatten() {
                            if sibling != &name {
                                self.docker.remove_service(sibling).await?;
                                self.monitored.remove(sibling);
                                completed_services.insert(sibling.clone());
                            }
                        }
                    }
                    completed_services.insert(name);
                }
                TaskState::FAILED
                | TaskState::SHUTDOWN
                | TaskState::REJECTED
                | TaskState::ORPHANED
                | TaskState::REMOVE => {
                    self.recover_service(&name, &job_id, state).await?;
                }
                _ => {}
            }
        }

        // Jobs whose every service has now completed move to COMPLETED.
        for (job_id, names) in &live_jobs {
            if names.iter().all(|name| completed_services.contains(name)) {
                self.complete_job(job_id).await;
            }
        }
        Ok(())
    }

    /// Re-capture attributes for a service created by a previous monitor
    /// process, so this one can recreate it if it fails.
    fn take_over_if_unknown(&self, name: &str, job_id: &str, service: &Service) {
        if self.monitored.contains_key(name) {
            return;
        }
        if let Some(spec) = capture_worker_spec(name, service) {
            debug!(service = %name, "taking over monitoring of existing service");
            self.monitored.insert(
                name.to_string(),
                MonitoredService {
                    job_id: job_id.to_string(),
                    spec,
                    restarts: 0,
                },
            );
        } else {
            warn!(service = %name, "cannot capture attributes of existing service");
        }
    }

    /// Tear down a job's services when a stop was requested. Returns whether
    /// the job is in the stop flow (so per-state handling is skipped).
    async fn handle_stop_request(
        &self,
        job_id: &str,
        live_jobs: &HashMap<String, Vec<String>>,
    ) -> Result<bool> {
        let Some(job) = self.jobs.retrieve(job_id).await? else {
            return Ok(false);
        };
        if job.status.step != JobStep::StopRequested {
            return Ok(false);
        }

        info!(job_id, "stopping job services");
        if let Some(names) = live_jobs.get(job_id) {
            for name in names {
                self.docker.remove_service(name).await?;
                self.monitored.remove(name);
            }
        }
        let stopped = JobStatus::with_step(job.status.phase, JobStep::Stopped);
        if let Err(err) = self.jobs.transition(job_id, stopped).await {
            error!(job_id, "could not mark job stopped: {err}");
        }
        Ok(true)
    }

    /// Remove a failed service and recreate it from captured attributes, or
    /// fail the whole job once the restart budget is spent.
    async fn recover_service(&self, name: &str, job_id: &str, state: TaskState) -> Result<()> {
        warn!(service = %name, job_id, ?state, "service task left the running set");
        self.docker.remove_service(name).await?;

        let Some(mut entry) = self.monitored.get_mut(name) else {
            warn!(service = %name, "no captured attributes; failing job");
            self.fail_job(job_id).await;
            return Ok(());
        };

        if entry.restarts >= self.config.restart_budget {
            info!(
                service = %name,
                job_id,
                budget = self.config.restart_budget,
                "restart budget exhausted"
            );
            drop(entry);
            self.monitored.remove(name);
            self.fail_job(job_id).await;
            return Ok(());
        }

        entry.restarts += 1;
        let spec = entry.spec.clone();
        let attempt = entry.restarts;
        drop(entry);

        info!(service = %name, job_id, attempt, "recreating service");
        self.docker
            .create_service(spec.to_service_spec(self.config.restart_budget))
            .await?;
        Ok(())
    }

    async fn complete_job(&self, job_id: &str) {
        match self
            .jobs
            .transition(job_id, JobStatus::new(JobPhase::Completed))
            .await
        {
            Ok(outcome) if outcome.success => info!(job_id, "job completed"),
            Ok(outcome) => debug!(job_id, reason = %outcome.reason, "completion skipped"),
            Err(err) => error!(job_id, "could not complete job: {err}"),
        }
    }

    /// Fail a job, remove whatever services it still has, and release its
    /// allocations (done by the terminal transition).
    async fn fail_job(&self, job_id: &str) {
        let doomed: Vec<String> = self
            .monitored
            .iter()
            .filter(|entry| entry.value().job_id == job_id)
            .map(|entry| entry.key().clone())
            .collect();
        for name in doomed {
            if let Err(err) = self.docker.remove_service(&name).await {
                warn!(service = %name, "teardown failed: {err}");
            }
            self.monitored.remove(&name);
        }
        match self
            .jobs
            .transition(job_id, JobStatus::new(JobPhase::Failed))
            .await
        {
            Ok(outcome) if outcome.success => info!(job_id, "job failed"),
            Ok(outcome) => debug!(job_id, reason = %outcome.reason, "failure transition skipped"),
            Err(err) => error!(job_id, "could not fail job: {err}"),
        }
    }
}

/// Whether a service name is the rank-0 (model entrypoint) partition.
fn is_rank_zero(name: &str, basename: &str) -> bool {
    name.strip_prefix(basename)
        .map(|rest| rest.starts_with("0_"))
        .unwrap_or(false)
}

/// Service name and embedded job id, when the service is one of ours.
fn identify(service: &Service) -> Option<(&str, &str)> {
    let name = service.spec.as_ref()?.name.as_deref()?;
    let job_id = job_id_from_service_name(name)?;
    Some((name, job_id))
}

/// The state that decides this pass's action for a service. Later task
/// states win so a recreated task supersedes the history of its
/// predecessors.
fn decisive_state(states: &[TaskState]) -> Option<TaskState> {
    if states
        .iter()
        .any(|state| matches!(state, TaskState::RUNNING | TaskState::STARTING))
    {
        return None;
    }
    states.last().copied()
}

/// Rebuild a [`WorkerService`] from a live service's spec.
fn capture_worker_spec(name: &str, service: &Service) -> Option<WorkerService> {
    let spec = service.spec.as_ref()?;
    let task = spec.task_template.as_ref()?;
    let container = task.container_spec.as_ref()?;
    let labels = spec.labels.clone().unwrap_or_default();

    let constraint_host = task
        .placement
        .as_ref()
        .and_then(|placement| placement.constraints.as_ref())
        .and_then(|constraints| constraints.first())
        .and_then(|constraint| constraint.split("==").nth(1))
        .map(|host| host.trim().to_string())
        .or_else(|| labels.get("hostname").cloned())?;

    let mounts = container
        .mounts
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|mount| {
            Some(MountSpec {
                host_dir: mount.source?,
                container_dir: mount.target?,
            })
        })
        .collect();

    let network = task
        .networks
        .as_ref()
        .and_then(|networks| networks.first())
        .and_then(|network| network.target.clone())
        .unwrap_or_default();

    Some(WorkerService {
        name: name.to_string(),
        image: container.image.clone()?,
        command: container.command.clone().unwrap_or_default(),
        args: container.args.clone().unwrap_or_default(),
        constraint_host,
        mounts,
        cpus_allocated: labels
            .get("cpus_allocated")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0),
        labels,
        network,
    })
}
