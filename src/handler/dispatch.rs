//! Request dispatch.
//!
//! One method per event type, all taking typed messages and returning the
//! response envelope. The multi-stage submission pipeline lives in
//! [`RequestHandler::handle_model_exec`]: authenticate the session secret,
//! authorize the user, validate the model request, and forward to the
//! scheduler.

use crate::client::SchedulerApi;
use crate::handler::auth::AuthOracle;
use crate::handler::messages::{
    JobControlAction, JobControlRequest, JobInfoRequest, JobListRequest, ModelExecRequest,
    Response, ResponseReason, SessionInitMessage, UpdateAck, UpdateMessage,
};
use crate::job::{JobManager, JobStatus, JobStep, SchedulerRequest};
use crate::session::{Session, SessionManager};
use crate::model::ModelRegistry;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long a STOP control waits for the job to actually stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Dispatches authenticated client requests.
pub struct RequestHandler {
    sessions: SessionManager,
    jobs: JobManager,
    scheduler: Arc<dyn SchedulerApi>,
    auth: Arc<dyn AuthOracle>,
    models: ModelRegistry,
    stop_timeout: Duration,
}

impl RequestHandler {
    pub fn new(
        sessions: SessionManager,
        jobs: JobManager,
        scheduler: Arc<dyn SchedulerApi>,
        auth: Arc<dyn AuthOracle>,
        models: ModelRegistry,
    ) -> Self {
        Self {
            sessions,
            jobs,
            scheduler,
            auth,
            models,
            stop_timeout: STOP_TIMEOUT,
        }
    }

    /// Override the stop-control timeout (tests).
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// The job manager this handler reads from.
    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    /// SESSION_INIT: authenticate against the oracle and create a session.
    pub async fn handle_session_init(
        &self,
        message: SessionInitMessage,
        ip_address: &str,
    ) -> Response {
        let authenticated = match self
            .auth
            .authenticate(&message.username, &message.user_secret)
            .await
        {
            Ok(authenticated) => authenticated,
            Err(err) => {
                warn!(user = %message.username, "authentication system failure: {err}");
                return Response::fail(
                    ResponseReason::AuthenticationSysFail,
                    "authentication could not be performed",
                    serde_json::Value::Null,
                );
            }
        };
        if !authenticated {
            return Response::fail(
                ResponseReason::AuthenticationDenied,
                "credentials rejected",
                serde_json::Value::Null,
            );
        }

        match self.sessions.create(ip_address, &message.username).await {
            Ok(session) => {
                info!(user = %message.username, session_id = session.session_id, "session initialized");
                Response::ok(
                    ResponseReason::Accepted,
                    "session created",
                    serde_json::to_value(&session).unwrap_or_default(),
                )
            }
            Err(err) => {
                warn!(user = %message.username, "session creation failed: {err}");
                Response::fail(
                    ResponseReason::SessionManagerFail,
                    "could not create session",
                    serde_json::Value::Null,
                )
            }
        }
    }

    /// Job submission: authenticate, authorize, validate, dispatch.
    ///
    /// Returns the response plus the job id when a submission was accepted,
    /// so the connection layer can start an update stream.
    pub async fn handle_model_exec(
        &self,
        request: ModelExecRequest,
    ) -> (Response, Option<String>) {
        let session = match self.session_for_secret(&request.session_secret).await {
            Ok(session) => session,
            Err(response) => return (response, None),
        };

        match self.auth.authorize(&session.user).await {
            Ok(true) => {}
            Ok(false) => {
                return (
                    Response::fail(
                        ResponseReason::Unauthorized,
                        format!("user {} may not submit model executions", session.user),
                        json!({ "job_id": "-1" }),
                    ),
                    None,
                );
            }
            Err(err) => {
                warn!(user = %session.user, "authorization failure: {err}");
                return (
                    Response::fail(
                        ResponseReason::AuthenticationSysFail,
                        "authorization could not be performed",
                        json!({ "job_id": "-1" }),
                    ),
                    None,
                );
            }
        }

        // Exactly one model per submission.
        let (model_name, payload) = match request.model.iter().next() {
            Some((name, payload)) if request.model.len() == 1 => (name.clone(), payload.clone()),
            _ => {
                return (
                    Response::fail(
                        ResponseReason::InvalidRequest,
                        "submission must name exactly one model",
                        json!({ "job_id": "-1" }),
                    ),
                    None,
                );
            }
        };

        if let Err(failures) =
            self.models
                .validate(&model_name, &payload.output, &payload.parameters)
        {
            return (
                Response::fail(
                    ResponseReason::InvalidRequest,
                    "model request failed validation",
                    json!({ "job_id": "-1", "errors": failures }),
                ),
                None,
            );
        }

        let scheduler_request = SchedulerRequest {
            model_name,
            version: payload.version,
            output: payload.output,
            parameters: payload.parameters,
            cpus: request.cpus,
            memory: request.memory,
            allocation_paradigm: request.allocation_paradigm,
            config_data_id: request.config_data_id,
            session_secret: request.session_secret.clone(),
            user_id: session.user.clone(),
        };

        match self.scheduler.make_request(&scheduler_request).await {
            Ok(scheduler_response) if scheduler_response.success => {
                let job_id = scheduler_response.job_id.clone();
                info!(job_id = %job_id, user = %session.user, "job submission accepted");
                (
                    Response::ok(
                        ResponseReason::Accepted,
                        "model execution request scheduled",
                        json!({
                            "job_id": job_id,
                            "scheduler_response": scheduler_response,
                        }),
                    ),
                    Some(job_id),
                )
            }
            Ok(scheduler_response) => (
                Response::fail(
                    ResponseReason::Rejected,
                    "the scheduler rejected the request",
                    json!({
                        "job_id": "-1",
                        "scheduler_response": scheduler_response,
                    }),
                ),
                None,
            ),
            Err(err) => {
                warn!("scheduler RPC failed: {err}");
                (
                    Response::fail(
                        ResponseReason::Rejected,
                        format!("scheduler unavailable: {err}"),
                        json!({ "job_id": "-1" }),
                    ),
                    None,
                )
            }
        }
    }

    /// JOB_CONTROL: STOP, RELEASE, or RESTART.
    pub async fn handle_job_control(&self, request: JobControlRequest) -> Response {
        if let Err(response) = self.session_for_secret(&request.session_secret).await {
            return response;
        }

        let outcome = match request.action {
            JobControlAction::Stop => {
                let outcome = match self.jobs.request_stop(&request.job_id).await {
                    Ok(outcome) => outcome,
                    Err(err) => return internal_failure(err),
                };
                if !outcome.success {
                    return outcome_response(&request.job_id, outcome);
                }
                // Wait (bounded) for the scheduler to actually stop it.
                match self.await_stopped(&request.job_id).await {
                    Some(outcome) => outcome,
                    None => {
                        return Response::fail(
                            ResponseReason::Timeout,
                            format!(
                                "job {} did not stop within {}s",
                                request.job_id,
                                self.stop_timeout.as_secs()
                            ),
                            json!({ "job_id": request.job_id }),
                        );
                    }
                }
            }
            JobControlAction::Release => match self.jobs.release_allocations(&request.job_id).await
            {
                Ok(outcome) => outcome,
                Err(err) => return internal_failure(err),
            },
            JobControlAction::Restart => match self.jobs.request_restart(&request.job_id).await {
                Ok(outcome) => outcome,
                Err(err) => return internal_failure(err),
            },
        };
        outcome_response(&request.job_id, outcome)
    }

    async fn await_stopped(&self, job_id: &str) -> Option<crate::job::OpOutcome> {
        let deadline = tokio::time::Instant::now() + self.stop_timeout;
        while tokio::time::Instant::now() < deadline {
            match self.jobs.retrieve(job_id).await {
                Ok(Some(job)) if job.status.step == JobStep::Stopped => {
                    return Some(crate::job::OpOutcome::ok(
                        "STOPPED",
                        format!("job {job_id} stopped"),
                    ));
                }
                Ok(Some(_)) => {}
                _ => return None,
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        None
    }

    /// JOB_INFO: a job's full record or just its status.
    pub async fn handle_job_info(&self, request: JobInfoRequest) -> Response {
        if let Err(response) = self.session_for_secret(&request.session_secret).await {
            return response;
        }
        let job = match self.jobs.retrieve(&request.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                return Response::fail(
                    ResponseReason::UnknownJob,
                    format!("no job {}", request.job_id),
                    json!({ "job_id": request.job_id }),
                );
            }
            Err(err) => return internal_failure(err),
        };
        let data = if request.status_only {
            json!({ "job_id": job.job_id, "status": job.status.to_string() })
        } else {
            serde_json::to_value(&job).unwrap_or_default()
        };
        Response::ok(ResponseReason::Accepted, "job record", data)
    }

    /// JOB_LIST: all job ids, or only active ones.
    pub async fn handle_job_list(&self, request: JobListRequest) -> Response {
        if let Err(response) = self.session_for_secret(&request.session_secret).await {
            return response;
        }
        match self.jobs.get_ids(request.only_active).await {
            Ok(ids) => Response::ok(
                ResponseReason::Accepted,
                "job listing",
                json!({ "jobs": ids }),
            ),
            Err(err) => internal_failure(err),
        }
    }

    /// UPDATE from a client: mutate an active job's permitted fields
    /// (currently only `status`). Acknowledged by digest.
    pub async fn handle_update(&self, message: UpdateMessage) -> UpdateAck {
        let refused = |found: bool| UpdateAck {
            digest: message.digest.clone(),
            object_found: found,
            success: false,
        };

        if message.object_type != "Job" {
            return refused(false);
        }
        let new_status: JobStatus = match message
            .updated_data
            .get("status")
            .and_then(|raw| raw.parse().ok())
        {
            Some(status) => status,
            None => return refused(false),
        };
        let job = match self.jobs.retrieve(&message.object_id).await {
            Ok(Some(job)) => job,
            _ => return refused(false),
        };
        if !job.is_active() {
            return refused(true);
        }
        match self.jobs.transition(&message.object_id, new_status).await {
            Ok(outcome) => UpdateAck {
                digest: message.digest.clone(),
                object_found: true,
                success: outcome.success,
            },
            Err(_) => refused(true),
        }
    }

    /// Resolve and refresh the session for a secret, or build the failure
    /// response.
    async fn session_for_secret(&self, secret: &str) -> std::result::Result<Session, Response> {
        match self.sessions.lookup_by_secret(secret).await {
            Ok(Some(mut session)) => {
                match self.sessions.refresh(&mut session).await {
                    Ok(true) => Ok(session),
                    Ok(false) => Err(Response::fail(
                        ResponseReason::UnrecognizedSessionSecret,
                        "session expired",
                        json!({ "job_id": "-1" }),
                    )),
                    Err(err) => {
                        warn!("session refresh failed: {err}");
                        Err(Response::fail(
                            ResponseReason::SessionManagerFail,
                            "session manager failure",
                            json!({ "job_id": "-1" }),
                        ))
                    }
                }
            }
            Ok(None) => Err(Response::fail(
                ResponseReason::UnrecognizedSessionSecret,
                "no session for the provided secret",
                json!({ "job_id": "-1" }),
            )),
            Err(err) => {
                warn!("session lookup failed: {err}");
                Err(Response::fail(
                    ResponseReason::SessionManagerFail,
                    "session manager failure",
                    json!({ "job_id": "-1" }),
                ))
            }
        }
    }
}

fn outcome_response(job_id: &str, outcome: crate::job::OpOutcome) -> Response {
    let data = json!({ "job_id": job_id });
    if outcome.success {
        Response {
            success: true,
            reason: outcome.reason,
            message: outcome.message,
            data,
        }
    } else {
        Response {
            success: false,
            reason: outcome.reason,
            message: outcome.message,
            data,
        }
    }
}

fn internal_failure(err: crate::job::JobError) -> Response {
    warn!("job manager failure: {err}");
    Response::fail(
        ResponseReason::SessionManagerFail,
        format!("internal failure: {err}"),
        serde_json::Value::Null,
    )
}
