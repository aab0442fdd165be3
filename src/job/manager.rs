//! KV-backed job manager.

use crate::job::{
    is_valid_transition, Job, JobError, JobPhase, JobStatus, JobStep, Result, SchedulerRequest,
};
use crate::kv::{KeyNamespace, KvStore, WriteBatch};
use crate::resource::ResourceManager;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

/// Conflict retries before a save gives up.
const SAVE_RETRY_LIMIT: u32 = 16;

/// Outcome triple returned by job control operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpOutcome {
    pub success: bool,
    pub reason: String,
    pub message: String,
}

impl OpOutcome {
    pub fn ok(reason: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn fail(reason: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Persists jobs and drives the lifecycle state machine, coordinating with
/// the resource manager for allocation release.
#[derive(Clone)]
pub struct JobManager {
    store: KvStore,
    keys: KeyNamespace,
    pool: String,
    resources: ResourceManager,
}

impl JobManager {
    pub fn new(
        store: KvStore,
        keys: KeyNamespace,
        pool: impl Into<String>,
        resources: ResourceManager,
    ) -> Self {
        Self {
            store,
            keys,
            pool: pool.into(),
            resources,
        }
    }

    fn job_key(&self, job_id: &str) -> String {
        self.keys.key(&["job", job_id])
    }

    fn jobs_key(&self) -> String {
        self.keys.key(&["jobs"])
    }

    fn running_key(&self) -> String {
        self.keys.key(&[&self.pool, "running"])
    }

    fn channel_key(&self, job_id: &str) -> String {
        self.keys.key(&[job_id, "COMMUNICATION"])
    }

    /// Subscribe to a job's status channel.
    pub async fn subscribe_status(&self, job_id: &str) -> Result<crate::kv::KvSubscription> {
        Ok(self.store.subscribe(&self.channel_key(job_id)).await?)
    }

    /// Create and persist a record for a newly received request.
    pub async fn create(&self, request: SchedulerRequest) -> Result<Job> {
        let job = Job::new(request);
        let job_key = self.job_key(&job.job_id);
        let mut batch = WriteBatch::new();
        for (field, value) in job.to_fields() {
            batch.hash_set(&job_key, field, &value);
        }
        batch.set_add(&self.jobs_key(), &job.job_id);
        batch.set_add(&self.running_key(), &job.job_id);
        self.store.apply(batch).await?;
        info!(job_id = %job.job_id, user = job.user_id(), "created job");
        Ok(job)
    }

    pub async fn does_exist(&self, job_id: &str) -> Result<bool> {
        Ok(self.store.hash_len(&self.job_key(job_id)).await? > 0)
    }

    pub async fn retrieve(&self, job_id: &str) -> Result<Option<Job>> {
        let fields = self.store.hash_get_all(&self.job_key(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Job::from_fields(job_id, &fields)
            .map(Some)
            .ok_or_else(|| JobError::CorruptRecord(job_id.to_string()))
    }

    /// Ids of all jobs, or only those still in an active phase.
    pub async fn get_ids(&self, only_active: bool) -> Result<Vec<String>> {
        let key = if only_active {
            self.running_key()
        } else {
            self.jobs_key()
        };
        let mut ids = self.store.set_members(&key).await?;
        ids.sort();
        Ok(ids)
    }

    /// Delete a job record outright. Returns whether a record existed.
    pub async fn delete(&self, job_id: &str) -> Result<bool> {
        let existed = self.does_exist(job_id).await?;
        let mut batch = WriteBatch::new();
        batch.delete(&self.job_key(job_id));
        batch.set_remove(&self.jobs_key(), job_id);
        batch.set_remove(&self.running_key(), job_id);
        self.store.apply(batch).await?;
        Ok(existed)
    }

    /// Persist a job, serialized against concurrent saves of the same record.
    ///
    /// Uses a watched compare-and-swap keyed on `last_updated`. When another
    /// writer got in after this caller's `retrieve`, the caller's status
    /// intent is re-applied onto the fresh record if the state machine still
    /// permits it; otherwise the save fails with `ConflictingUpdate`. On
    /// success the passed job is updated in place (including the bumped
    /// `last_updated`), and a status change is published to the job's
    /// channel.
    pub async fn save(&self, job: &mut Job) -> Result<()> {
        let job_key = self.job_key(&job.job_id);
        for _ in 0..SAVE_RETRY_LIMIT {
            let mut tx = self.store.watch(&[job_key.as_str()]).await?;
            let fields = tx.hash_get_all(&job_key).await?;
            let persisted = if fields.is_empty() {
                None
            } else {
                Some(
                    Job::from_fields(&job.job_id, &fields)
                        .ok_or_else(|| JobError::CorruptRecord(job.job_id.clone()))?,
                )
            };

            let previous_status = persisted.as_ref().map(|p| p.status);
            let mut to_write = match persisted {
                Some(p) if p.last_updated > job.last_updated => {
                    // Someone else saved after our snapshot; re-apply intent.
                    if !is_valid_transition(&p.status, &job.status) {
                        tx.abort().await?;
                        return Err(JobError::ConflictingUpdate(job.job_id.clone()));
                    }
                    debug!(job_id = %job.job_id, "merging over concurrent update");
                    let mut merged = p;
                    merged.status = job.status;
                    merged.allocations = job.allocations.clone();
                    merged.rsa_key_pair = job.rsa_key_pair.clone();
                    merged
                }
                _ => job.clone(),
            };

            // last_updated is strictly monotonic per record.
            let now = Utc::now();
            to_write.last_updated = if now > to_write.last_updated {
                now
            } else {
                to_write.last_updated + Duration::milliseconds(1)
            };

            for (field, value) in to_write.to_fields() {
                tx.stage().hash_set(&job_key, field, &value);
            }
            tx.stage().set_add(&self.jobs_key(), &job.job_id);
            if to_write.is_active() {
                tx.stage().set_add(&self.running_key(), &job.job_id);
            } else {
                tx.stage().set_remove(&self.running_key(), &job.job_id);
            }

            if tx.exec().await? {
                let status_changed = previous_status != Some(to_write.status);
                if status_changed {
                    let payload = to_write.status.to_string();
                    if let Err(err) = self
                        .store
                        .publish(&self.channel_key(&job.job_id), &payload)
                        .await
                    {
                        warn!(job_id = %job.job_id, "failed to publish status change: {err}");
                    }
                }
                *job = to_write;
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
        Err(JobError::Store(crate::kv::KvError::RetriesExceeded(
            SAVE_RETRY_LIMIT,
        )))
    }

    /// Move a job to a new status, enforcing the state machine and running
    /// terminal cleanup (allocation release, key deletion) when entering
    /// COMPLETED or FAILED.
    pub async fn transition(&self, job_id: &str, new_status: JobStatus) -> Result<OpOutcome> {
        let mut job = match self.retrieve(job_id).await? {
            Some(job) => job,
            None => return Ok(OpOutcome::fail("UNKNOWN_JOB", format!("no job {job_id}"))),
        };
        if !is_valid_transition(&job.status, &new_status) {
            return Ok(OpOutcome::fail(
                "INVALID_STATE",
                format!("cannot move job {job_id} from {} to {}", job.status, new_status),
            ));
        }
        let from = job.status;
        job.status = new_status;
        if matches!(new_status.phase, JobPhase::Completed | JobPhase::Failed) {
            self.finalize(&mut job).await?;
        }
        self.save(&mut job).await?;
        info!(job_id, %from, to = %new_status, "job transitioned");
        Ok(OpOutcome::ok("OK", format!("job {job_id} is now {new_status}")))
    }

    /// Release allocations back to the pool and delete key material.
    async fn finalize(&self, job: &mut Job) -> Result<()> {
        if !job.allocations.is_empty() {
            self.resources.release(&job.allocations).await?;
            job.allocations.clear();
        }
        if let Some(key_pair) = job.rsa_key_pair.take() {
            if let Err(err) = key_pair.delete_files() {
                warn!(job_id = %job.job_id, "failed to delete key pair: {err}");
            }
        }
        Ok(())
    }

    /// Ask an active job to stop.
    pub async fn request_stop(&self, job_id: &str) -> Result<OpOutcome> {
        let mut job = match self.retrieve(job_id).await? {
            Some(job) => job,
            None => return Ok(OpOutcome::fail("UNKNOWN_JOB", format!("no job {job_id}"))),
        };
        if !job.is_active() {
            return Ok(OpOutcome::fail(
                "NOT_ACTIVE",
                format!("job {job_id} is {} and cannot be stopped", job.status),
            ));
        }
        if job.status.step != JobStep::Default {
            return Ok(OpOutcome::fail(
                "INVALID_STATE",
                format!("job {job_id} is already {}", job.status),
            ));
        }
        job.status = JobStatus::with_step(job.status.phase, JobStep::StopRequested);
        self.save(&mut job).await?;
        Ok(OpOutcome::ok(
            "STOP_REQUESTED",
            format!("stop requested for job {job_id}"),
        ))
    }

    /// Release a job's allocations, closing it if it reached a terminal
    /// phase. Releasing an already-released job is a successful no-op.
    pub async fn release_allocations(&self, job_id: &str) -> Result<OpOutcome> {
        let mut job = match self.retrieve(job_id).await? {
            Some(job) => job,
            None => return Ok(OpOutcome::fail("UNKNOWN_JOB", format!("no job {job_id}"))),
        };

        let had_allocations = !job.allocations.is_empty();
        if had_allocations {
            self.resources.release(&job.allocations).await?;
            job.allocations.clear();
        }
        let had_key_pair = job.rsa_key_pair.is_some();
        if let Some(key_pair) = job.rsa_key_pair.take() {
            if let Err(err) = key_pair.delete_files() {
                warn!(job_id, "failed to delete key pair: {err}");
            }
        }
        let mut changed = had_allocations || had_key_pair;
        if matches!(job.status.phase, JobPhase::Completed | JobPhase::Failed) {
            job.status = JobStatus::new(JobPhase::Closed);
            changed = true;
        }
        if changed {
            self.save(&mut job).await?;
        }
        Ok(OpOutcome::ok(
            "RELEASED",
            if had_allocations {
                format!("released allocations for job {job_id}")
            } else {
                format!("job {job_id} had no allocations to release")
            },
        ))
    }

    /// Restart a stopped job by sending it back through scheduling.
    pub async fn request_restart(&self, job_id: &str) -> Result<OpOutcome> {
        let mut job = match self.retrieve(job_id).await? {
            Some(job) => job,
            None => return Ok(OpOutcome::fail("UNKNOWN_JOB", format!("no job {job_id}"))),
        };
        if job.status.step != JobStep::Stopped {
            return Ok(OpOutcome::fail(
                "NOT_STOPPED",
                format!("job {job_id} is {} and cannot be restarted", job.status),
            ));
        }
        job.status = JobStatus::new(JobPhase::AwaitingScheduling);
        self.save(&mut job).await?;
        Ok(OpOutcome::ok(
            "RESTART_REQUESTED",
            format!("job {job_id} requeued for scheduling"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Parameter;
    use crate::resource::{AllocationParadigm, Resource};
    use std::collections::HashMap;

    fn request() -> SchedulerRequest {
        SchedulerRequest {
            model_name: "NWM".to_string(),
            version: 2.0,
            output: "streamflow".to_string(),
            parameters: HashMap::<String, Parameter>::new(),
            cpus: 4,
            memory: 500_000_000,
            allocation_paradigm: AllocationParadigm::SingleNode,
            config_data_id: None,
            session_secret: "secret".to_string(),
            user_id: "u1".to_string(),
        }
    }

    async fn managers() -> (JobManager, ResourceManager) {
        let store = KvStore::in_memory();
        let keys = KeyNamespace::new("test");
        let resources = ResourceManager::new(store.clone(), keys.clone());
        resources
            .set_resources([Resource::new("node-0", "host-0", 18, 1_000_000_000)])
            .await
            .unwrap();
        let jobs = JobManager::new(store, keys, "maas", resources.clone());
        (jobs, resources)
    }

    #[tokio::test]
    async fn test_create_and_retrieve_roundtrip() {
        let (jobs, _) = managers().await;
        let created = jobs.create(request()).await.unwrap();
        let retrieved = jobs.retrieve(&created.job_id).await.unwrap().unwrap();
        assert_eq!(retrieved.job_id, created.job_id);
        assert_eq!(retrieved.status, JobStatus::new(JobPhase::Created));
        assert_eq!(retrieved.originating_request, created.originating_request);
        assert!(jobs.does_exist(&created.job_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_ids_filters_by_active() {
        let (jobs, _) = managers().await;
        let active = jobs.create(request()).await.unwrap();
        let mut done = jobs.create(request()).await.unwrap();
        for phase in [
            JobPhase::AwaitingAllocation,
            JobPhase::AwaitingScheduling,
            JobPhase::Running,
            JobPhase::Completed,
        ] {
            done.status = JobStatus::new(phase);
            jobs.save(&mut done).await.unwrap();
        }

        let all = jobs.get_ids(false).await.unwrap();
        assert_eq!(all.len(), 2);
        let running = jobs.get_ids(true).await.unwrap();
        assert_eq!(running, vec![active.job_id.clone()]);
    }

    #[tokio::test]
    async fn test_save_bumps_last_updated_monotonically() {
        let (jobs, _) = managers().await;
        let mut job = jobs.create(request()).await.unwrap();
        let mut previous = job.last_updated;
        for _ in 0..3 {
            jobs.save(&mut job).await.unwrap();
            assert!(job.last_updated > previous);
            previous = job.last_updated;
        }
    }

    #[tokio::test]
    async fn test_concurrent_save_merges_valid_intent() {
        let (jobs, _) = managers().await;
        let job = jobs.create(request()).await.unwrap();

        // Two copies of the record diverge.
        let mut copy_a = jobs.retrieve(&job.job_id).await.unwrap().unwrap();
        let mut copy_b = jobs.retrieve(&job.job_id).await.unwrap().unwrap();

        copy_a.status = JobStatus::new(JobPhase::AwaitingAllocation);
        jobs.save(&mut copy_a).await.unwrap();

        // copy_b is stale but requests a transition still valid from the
        // persisted status.
        copy_b.status = JobStatus::new(JobPhase::AwaitingScheduling);
        jobs.save(&mut copy_b).await.unwrap();

        let persisted = jobs.retrieve(&job.job_id).await.unwrap().unwrap();
        assert_eq!(persisted.status, JobStatus::new(JobPhase::AwaitingScheduling));
    }

    #[tokio::test]
    async fn test_conflicting_save_rejected() {
        let (jobs, _) = managers().await;
        let job = jobs.create(request()).await.unwrap();

        let mut copy_a = jobs.retrieve(&job.job_id).await.unwrap().unwrap();
        let mut copy_b = jobs.retrieve(&job.job_id).await.unwrap().unwrap();

        // Drive the job to COMPLETED through a, then b tries to regress.
        for phase in [
            JobPhase::AwaitingAllocation,
            JobPhase::AwaitingScheduling,
            JobPhase::Running,
            JobPhase::Completed,
        ] {
            copy_a.status = JobStatus::new(phase);
            jobs.save(&mut copy_a).await.unwrap();
        }
        copy_b.status = JobStatus::new(JobPhase::Running);
        assert!(matches!(
            jobs.save(&mut copy_b).await,
            Err(JobError::ConflictingUpdate(_))
        ));
    }

    #[tokio::test]
    async fn test_transition_to_completed_releases_allocations() {
        let (jobs, resources) = managers().await;
        let mut job = jobs.create(request()).await.unwrap();
        job.status = JobStatus::new(JobPhase::AwaitingAllocation);
        jobs.save(&mut job).await.unwrap();

        let allocation = resources
            .allocate("node-0", 4, 500_000_000, false)
            .await
            .unwrap()
            .unwrap();
        job.allocations.push(allocation);
        job.status = JobStatus::new(JobPhase::AwaitingScheduling);
        jobs.save(&mut job).await.unwrap();
        job.status = JobStatus::new(JobPhase::Running);
        jobs.save(&mut job).await.unwrap();
        assert_eq!(resources.available_cpu_count().await.unwrap(), 14);

        let outcome = jobs
            .transition(&job.job_id, JobStatus::new(JobPhase::Completed))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(resources.available_cpu_count().await.unwrap(), 18);
        let persisted = jobs.retrieve(&job.job_id).await.unwrap().unwrap();
        assert!(persisted.allocations.is_empty());
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_closes() {
        let (jobs, _) = managers().await;
        let mut job = jobs.create(request()).await.unwrap();
        for phase in [
            JobPhase::AwaitingAllocation,
            JobPhase::AwaitingScheduling,
            JobPhase::Running,
            JobPhase::Completed,
        ] {
            job.status = JobStatus::new(phase);
            jobs.save(&mut job).await.unwrap();
        }

        let first = jobs.release_allocations(&job.job_id).await.unwrap();
        assert!(first.success);
        let persisted = jobs.retrieve(&job.job_id).await.unwrap().unwrap();
        assert_eq!(persisted.status.phase, JobPhase::Closed);

        // Releasing again is a successful no-op.
        let second = jobs.release_allocations(&job.job_id).await.unwrap();
        assert!(second.success);
    }

    #[tokio::test]
    async fn test_stop_then_restart_flow() {
        let (jobs, _) = managers().await;
        let mut job = jobs.create(request()).await.unwrap();
        for phase in [
            JobPhase::AwaitingAllocation,
            JobPhase::AwaitingScheduling,
            JobPhase::Running,
        ] {
            job.status = JobStatus::new(phase);
            jobs.save(&mut job).await.unwrap();
        }

        let outcome = jobs.request_stop(&job.job_id).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.reason, "STOP_REQUESTED");

        // Restart is refused until the job actually stops.
        let premature = jobs.request_restart(&job.job_id).await.unwrap();
        assert!(!premature.success);

        jobs.transition(
            &job.job_id,
            JobStatus::with_step(JobPhase::Running, JobStep::Stopped),
        )
        .await
        .unwrap();
        let restarted = jobs.request_restart(&job.job_id).await.unwrap();
        assert!(restarted.success);
        let persisted = jobs.retrieve(&job.job_id).await.unwrap().unwrap();
        assert_eq!(persisted.status, JobStatus::new(JobPhase::AwaitingScheduling));
    }

    #[tokio::test]
    async fn test_status_changes_are_published() {
        let (jobs, _) = managers().await;
        let mut job = jobs.create(request()).await.unwrap();
        let mut subscription = jobs.subscribe_status(&job.job_id).await.unwrap();

        job.status = JobStatus::new(JobPhase::AwaitingAllocation);
        jobs.save(&mut job).await.unwrap();

        let published = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            subscription.next_message(),
        )
        .await
        .unwrap();
        assert_eq!(published, Some("AWAITING_ALLOCATION_DEFAULT".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_job_outcomes() {
        let (jobs, _) = managers().await;
        for outcome in [
            jobs.request_stop("missing").await.unwrap(),
            jobs.release_allocations("missing").await.unwrap(),
            jobs.request_restart("missing").await.unwrap(),
        ] {
            assert!(!outcome.success);
            assert_eq!(outcome.reason, "UNKNOWN_JOB");
        }
        assert!(!jobs.delete("missing").await.unwrap());
    }
}
