//! Job records and the lifecycle state machine.

use crate::job::RsaKeyPair;
use crate::model::Parameter;
use crate::resource::{Allocation, AllocationParadigm};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Coarse lifecycle phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    Created,
    AwaitingAllocation,
    AwaitingScheduling,
    AwaitingData,
    Running,
    Completed,
    Closed,
    Failed,
}

impl JobPhase {
    /// Phases up to and including RUNNING count as active for list filtering
    /// and update streaming.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobPhase::Created
                | JobPhase::AwaitingAllocation
                | JobPhase::AwaitingScheduling
                | JobPhase::AwaitingData
                | JobPhase::Running
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Created => "CREATED",
            JobPhase::AwaitingAllocation => "AWAITING_ALLOCATION",
            JobPhase::AwaitingScheduling => "AWAITING_SCHEDULING",
            JobPhase::AwaitingData => "AWAITING_DATA",
            JobPhase::Running => "RUNNING",
            JobPhase::Completed => "COMPLETED",
            JobPhase::Closed => "CLOSED",
            JobPhase::Failed => "FAILED",
        }
    }
}

/// Fine-grained step within a phase, tracking the stop/restart flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStep {
    Default,
    StopRequested,
    Stopped,
    RestartRequested,
    Failed,
}

impl JobStep {
    const ALL: [JobStep; 5] = [
        JobStep::Default,
        JobStep::StopRequested,
        JobStep::Stopped,
        JobStep::RestartRequested,
        JobStep::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStep::Default => "DEFAULT",
            JobStep::StopRequested => "STOP_REQUESTED",
            JobStep::Stopped => "STOPPED",
            JobStep::RestartRequested => "RESTART_REQUESTED",
            JobStep::Failed => "FAILED",
        }
    }
}

/// Combined job status, serialized on the wire as `<PHASE>_<STEP>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub phase: JobPhase,
    pub step: JobStep,
}

impl JobStatus {
    pub fn new(phase: JobPhase) -> Self {
        Self {
            phase,
            step: JobStep::Default,
        }
    }

    pub fn with_step(phase: JobPhase, step: JobStep) -> Self {
        Self { phase, step }
    }

    pub fn is_active(&self) -> bool {
        self.phase.is_active()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.phase.as_str(), self.step.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    /// Parse a `<PHASE>_<STEP>` string. Phases themselves contain
    /// underscores, so the step is matched as a suffix.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        for step in JobStep::ALL {
            let suffix = format!("_{}", step.as_str());
            if let Some(phase_str) = raw.strip_suffix(&suffix) {
                let phase = match phase_str {
                    "CREATED" => JobPhase::Created,
                    "AWAITING_ALLOCATION" => JobPhase::AwaitingAllocation,
                    "AWAITING_SCHEDULING" => JobPhase::AwaitingScheduling,
                    "AWAITING_DATA" => JobPhase::AwaitingData,
                    "RUNNING" => JobPhase::Running,
                    "COMPLETED" => JobPhase::Completed,
                    "CLOSED" => JobPhase::Closed,
                    "FAILED" => JobPhase::Failed,
                    _ => continue,
                };
                return Ok(JobStatus { phase, step });
            }
        }
        Err(format!("unrecognized job status: {raw}"))
    }
}

/// Whether the state machine permits moving a job from `from` to `to`.
pub fn is_valid_transition(from: &JobStatus, to: &JobStatus) -> bool {
    use JobPhase::*;
    use JobStep::*;

    if from == to {
        // Re-saving the same status (e.g. an allocation retry) is permitted.
        return true;
    }
    // Unrecoverable failure is reachable from any state.
    if to.phase == JobPhase::Failed {
        return true;
    }
    // The stop flow advances the step while the phase holds still.
    if from.phase == to.phase && from.phase.is_active() {
        return matches!(
            (from.step, to.step),
            (Default, StopRequested) | (StopRequested, Stopped) | (Stopped, RestartRequested)
        );
    }
    // A stopped job restarts by re-entering scheduling.
    if matches!(from.step, Stopped | RestartRequested)
        && to.phase == AwaitingScheduling
        && to.step == Default
    {
        return true;
    }
    // Releasing a failed job closes it regardless of its step.
    if from.phase == JobPhase::Failed && to.phase == Closed {
        return true;
    }
    // Ordinary phase progression.
    if from.step == Default && to.step == Default {
        return matches!(
            (from.phase, to.phase),
            (Created, AwaitingAllocation)
                | (AwaitingAllocation, AwaitingScheduling)
                | (AwaitingScheduling, Running)
                | (AwaitingScheduling, AwaitingData)
                | (AwaitingData, AwaitingScheduling)
                | (Running, Completed)
                | (Completed, Closed)
        );
    }
    false
}

/// The client request a job was created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerRequest {
    pub model_name: String,
    pub version: f64,
    pub output: String,
    pub parameters: HashMap<String, Parameter>,
    pub cpus: u32,
    pub memory: u64,
    #[serde(default)]
    pub allocation_paradigm: AllocationParadigm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_data_id: Option<String>,
    pub session_secret: String,
    pub user_id: String,
}

/// One model execution request in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub originating_request: SchedulerRequest,
    pub status: JobStatus,
    pub allocations: Vec<Allocation>,
    pub rsa_key_pair: Option<RsaKeyPair>,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Job {
    /// Create a record for a newly received request, in phase CREATED.
    pub fn new(request: SchedulerRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            originating_request: request,
            status: JobStatus::new(JobPhase::Created),
            allocations: Vec::new(),
            rsa_key_pair: None,
            created: now,
            last_updated: now,
        }
    }

    pub fn cpu_count(&self) -> u32 {
        self.originating_request.cpus
    }

    pub fn memory_size(&self) -> u64 {
        self.originating_request.memory
    }

    pub fn user_id(&self) -> &str {
        &self.originating_request.user_id
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Total CPUs across the job's allocations.
    pub fn allocated_cpus(&self) -> u32 {
        self.allocations.iter().map(|a| a.cpus_allocated).sum()
    }

    /// Serialize to the persisted hash field layout.
    ///
    /// The request, allocations, and key pair are nested JSON values inside
    /// the hash; scalar fields stay directly readable.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("status", self.status.to_string()),
            ("created", self.created.to_rfc3339()),
            ("last_updated", self.last_updated.to_rfc3339()),
            (
                "originating_request",
                serde_json::to_string(&self.originating_request)
                    .unwrap_or_else(|_| "null".to_string()),
            ),
            (
                "allocations",
                serde_json::to_string(&self.allocations).unwrap_or_else(|_| "[]".to_string()),
            ),
            (
                "rsa_key_pair",
                serde_json::to_string(&self.rsa_key_pair).unwrap_or_else(|_| "null".to_string()),
            ),
        ]
    }

    /// Reconstruct from the persisted hash field layout.
    pub fn from_fields(job_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            job_id: job_id.to_string(),
            originating_request: serde_json::from_str(fields.get("originating_request")?).ok()?,
            status: fields.get("status")?.parse().ok()?,
            allocations: serde_json::from_str(fields.get("allocations")?).ok()?,
            rsa_key_pair: serde_json::from_str(fields.get("rsa_key_pair")?).ok()?,
            created: parse_timestamp(fields.get("created")?)?,
            last_updated: parse_timestamp(fields.get("last_updated")?)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}
