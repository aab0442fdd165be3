//! End-to-end request handler scenarios against a scheduler stub.
//!
//! The stub stands in for the scheduler RPC: on success it creates the job
//! record and walks it to RUNNING the way the real scheduler would; on
//! failure it returns a generic rejection.

use async_trait::async_trait;
use maasd::client::{ClientError, SchedulerApi};
use maasd::handler::messages::{
    parse_client_message, ClientMessage, JobControlAction, JobControlRequest, JobInfoRequest,
    JobListRequest, ModelExecRequest, SessionInitMessage, UpdateAck,
};
use maasd::handler::{run_job_update_stream, PermissiveAuth, RequestHandler, UpdateStreamConfig};
use maasd::job::{JobManager, JobPhase, JobStatus, JobStep};
use maasd::kv::{KeyNamespace, KvStore};
use maasd::model::ModelRegistry;
use maasd::resource::{Resource, ResourceManager};
use maasd::scheduler::SchedulerResponse;
use maasd::session::{SessionManager, SessionManagerConfig};
use maasd::SchedulerRequest;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

struct StubScheduler {
    jobs: JobManager,
    succeed: bool,
}

#[async_trait]
impl SchedulerApi for StubScheduler {
    async fn make_request(
        &self,
        request: &SchedulerRequest,
    ) -> Result<SchedulerResponse, ClientError> {
        if !self.succeed {
            return Ok(SchedulerResponse::rejected("stub rejection"));
        }
        let mut job = self
            .jobs
            .create(request.clone())
            .await
            .map_err(|err| ClientError::Protocol(err.to_string()))?;
        for phase in [
            JobPhase::AwaitingAllocation,
            JobPhase::AwaitingScheduling,
            JobPhase::Running,
        ] {
            job.status = JobStatus::new(phase);
            self.jobs
                .save(&mut job)
                .await
                .map_err(|err| ClientError::Protocol(err.to_string()))?;
        }
        Ok(SchedulerResponse::accepted(&job.job_id, json!({})))
    }
}

struct Fixture {
    handler: Arc<RequestHandler>,
    jobs: JobManager,
    sessions: SessionManager,
}

async fn fixture(scheduler_succeeds: bool) -> Fixture {
    let store = KvStore::in_memory();
    let keys = KeyNamespace::new("maas");
    let sessions = SessionManager::new(store.clone(), keys.clone(), SessionManagerConfig::default());
    let resources = ResourceManager::new(store.clone(), keys.clone());
    resources
        .set_resources([Resource::new("node-0000", "worker-0", 18, 64_000_000_000)])
        .await
        .unwrap();
    let jobs = JobManager::new(store, keys, "maas", resources);

    let handler = Arc::new(
        RequestHandler::new(
            sessions.clone(),
            jobs.clone(),
            Arc::new(StubScheduler {
                jobs: jobs.clone(),
                succeed: scheduler_succeeds,
            }),
            Arc::new(PermissiveAuth),
            ModelRegistry::with_defaults(),
        )
        .with_stop_timeout(Duration::from_millis(500)),
    );
    Fixture {
        handler,
        jobs,
        sessions,
    }
}

fn submit_text(secret: &str) -> String {
    format!(
        r#"{{
            "model": {{"NWM": {{"version": 2.0, "output": "streamflow",
                                "parameters": {{"k": {{"scalar": 5}}}}}}}},
            "session-secret": "{secret}",
            "cpus": 4,
            "memory": 500000000
        }}"#
    )
}

fn parse_submit(secret: &str) -> ModelExecRequest {
    match parse_client_message(&submit_text(secret)).unwrap() {
        ClientMessage::ModelExec(request) => request,
        other => panic!("unexpected parse: {other:?}"),
    }
}

#[tokio::test]
async fn submit_authorize_dispatch_complete() {
    let fixture = fixture(true).await;

    // SESSION_INIT equivalent.
    let init = fixture
        .handler
        .handle_session_init(
            SessionInitMessage {
                username: "u1".to_string(),
                user_secret: "pw".to_string(),
            },
            "10.0.0.2",
        )
        .await;
    assert!(init.success);
    let secret = init.data["session_secret"].as_str().unwrap().to_string();

    // Valid submission is accepted with a real job id.
    let (response, job_id) = fixture.handler.handle_model_exec(parse_submit(&secret)).await;
    assert!(response.success, "{response:?}");
    assert_eq!(response.reason, "ACCEPTED");
    let job_id = job_id.expect("accepted submissions carry a job id");
    assert!(!job_id.is_empty());
    assert_ne!(job_id, "-1");

    // Run the update stream with quick pacing; complete the job while it
    // watches.
    let (outbound_tx, mut outbound_rx) = mpsc::channel(16);
    let (ack_tx, ack_rx) = broadcast::channel(16);
    let stream = tokio::spawn(run_job_update_stream(
        fixture.jobs.clone(),
        job_id.clone(),
        outbound_tx,
        ack_rx,
        UpdateStreamConfig {
            initial_interval: Duration::from_millis(20),
            fast_iterations: 8,
            max_interval: Duration::from_millis(100),
            ack_timeout: Duration::from_millis(500),
        },
    ));

    let jobs = fixture.jobs.clone();
    let completer = {
        let job_id = job_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            jobs.transition(&job_id, JobStatus::new(JobPhase::Completed))
                .await
                .unwrap();
        })
    };

    let mut statuses = Vec::new();
    while let Some(frame) = outbound_rx.recv().await {
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "UPDATE");
        assert_eq!(value["object_type"], "Job");
        assert_eq!(value["object_id"], job_id);
        let digest = value["digest"].as_str().unwrap().to_string();
        statuses.push(value["updated_data"]["status"].as_str().unwrap().to_string());
        let _ = ack_tx.send(UpdateAck {
            digest,
            object_found: true,
            success: true,
        });
    }

    completer.await.unwrap();
    stream.await.unwrap();
    assert_eq!(statuses.last().map(String::as_str), Some("COMPLETED_DEFAULT"));
}

#[tokio::test]
async fn rejected_scheduler_yields_failure_with_embedded_response() {
    let fixture = fixture(false).await;
    let session = fixture.sessions.create("10.0.0.2", "u1").await.unwrap();

    let (response, job_id) = fixture
        .handler
        .handle_model_exec(parse_submit(&session.session_secret))
        .await;

    assert!(!response.success);
    assert_eq!(response.reason, "REJECTED");
    assert_eq!(job_id, None);
    assert_eq!(response.data["job_id"], "-1");
    assert_eq!(response.data["scheduler_response"]["success"], false);
}

#[tokio::test]
async fn unknown_secret_is_unrecognized() {
    let fixture = fixture(true).await;
    let (response, job_id) = fixture
        .handler
        .handle_model_exec(parse_submit("deadbeef"))
        .await;
    assert!(!response.success);
    assert_eq!(response.reason, "UNRECOGNIZED_SESSION_SECRET");
    assert_eq!(job_id, None);
}

#[tokio::test]
async fn invalid_model_request_reports_every_failure() {
    let fixture = fixture(true).await;
    let session = fixture.sessions.create("10.0.0.2", "u1").await.unwrap();

    let text = format!(
        r#"{{
            "model": {{"NWM": {{"version": 2.0, "output": "evaporation",
                                "parameters": {{"k": {{"scalar": 99}}}}}}}},
            "session-secret": "{}"
        }}"#,
        session.session_secret
    );
    let request = match parse_client_message(&text).unwrap() {
        ClientMessage::ModelExec(request) => request,
        other => panic!("unexpected parse: {other:?}"),
    };
    let (response, _) = fixture.handler.handle_model_exec(request).await;

    assert!(!response.success);
    assert_eq!(response.reason, "Invalid request");
    let errors = response.data["errors"].as_array().unwrap();
    // Bad output and bad scalar both reported.
    assert_eq!(errors.len(), 2);
}

#[tokio::test]
async fn job_info_and_list() {
    let fixture = fixture(true).await;
    let session = fixture.sessions.create("10.0.0.2", "u1").await.unwrap();
    let secret = session.session_secret.clone();

    let (_, job_id) = fixture.handler.handle_model_exec(parse_submit(&secret)).await;
    let job_id = job_id.unwrap();

    let info = fixture
        .handler
        .handle_job_info(JobInfoRequest {
            job_id: job_id.clone(),
            status_only: true,
            session_secret: secret.clone(),
        })
        .await;
    assert!(info.success);
    assert_eq!(info.data["status"], "RUNNING_DEFAULT");

    let listing = fixture
        .handler
        .handle_job_list(JobListRequest {
            only_active: true,
            session_secret: secret.clone(),
        })
        .await;
    assert!(listing.success);
    assert_eq!(listing.data["jobs"], json!([job_id.clone()]));

    let missing = fixture
        .handler
        .handle_job_info(JobInfoRequest {
            job_id: "nope".to_string(),
            status_only: false,
            session_secret: secret,
        })
        .await;
    assert!(!missing.success);
    assert_eq!(missing.reason, "UNKNOWN_JOB");
}

#[tokio::test]
async fn stop_control_times_out_without_a_scheduler() {
    let fixture = fixture(true).await;
    let session = fixture.sessions.create("10.0.0.2", "u1").await.unwrap();
    let secret = session.session_secret.clone();

    let (_, job_id) = fixture.handler.handle_model_exec(parse_submit(&secret)).await;
    let job_id = job_id.unwrap();

    // Nothing moves the job to STOPPED, so the bounded wait expires.
    let response = fixture
        .handler
        .handle_job_control(JobControlRequest {
            action: JobControlAction::Stop,
            job_id: job_id.clone(),
            session_secret: secret,
        })
        .await;
    assert!(!response.success);
    assert_eq!(response.reason, "TIMEOUT");

    let job = fixture.jobs.retrieve(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status.step, JobStep::StopRequested);
}

#[tokio::test]
async fn stop_control_succeeds_when_the_job_stops() {
    let fixture = fixture(true).await;
    let session = fixture.sessions.create("10.0.0.2", "u1").await.unwrap();
    let secret = session.session_secret.clone();

    let (_, job_id) = fixture.handler.handle_model_exec(parse_submit(&secret)).await;
    let job_id = job_id.unwrap();

    // Simulate the scheduler's monitor tearing services down.
    let jobs = fixture.jobs.clone();
    let stopper = {
        let job_id = job_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            jobs.transition(
                &job_id,
                JobStatus::with_step(JobPhase::Running, JobStep::Stopped),
            )
            .await
            .unwrap();
        })
    };

    let response = fixture
        .handler
        .handle_job_control(JobControlRequest {
            action: JobControlAction::Stop,
            job_id,
            session_secret: secret,
        })
        .await;
    stopper.await.unwrap();
    assert!(response.success, "{response:?}");
    assert_eq!(response.reason, "STOPPED");
}
