//! Wire message types and parsing.
//!
//! Every message is a JSON object. Requests carry an `event` tag where the
//! protocol defines one; the job-submit payload is recognized by shape
//! (`model` plus `session-secret`). Parsing walks an explicit, ordered table
//! of typed parsers; anything that matches none of them yields the typed
//! invalid-message response echoing the original payload.

use crate::model::Parameter;
use crate::resource::AllocationParadigm;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Event tags recognized by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEvent {
    SessionInit,
    ModelExecRequest,
    Update,
    JobControl,
    JobInfo,
    JobList,
}

impl MessageEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageEvent::SessionInit => "SESSION_INIT",
            MessageEvent::ModelExecRequest => "NWM_MAAS_REQUEST",
            MessageEvent::Update => "UPDATE",
            MessageEvent::JobControl => "JOB_CONTROL",
            MessageEvent::JobInfo => "JOB_INFO",
            MessageEvent::JobList => "JOB_LIST",
        }
    }
}

/// Short enum-like reason strings used in response envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseReason {
    Accepted,
    Rejected,
    InvalidRequest,
    Unauthorized,
    UnrecognizedSessionSecret,
    AuthenticationSysFail,
    AuthenticationDenied,
    SessionManagerFail,
    Timeout,
    UnknownJob,
}

impl ResponseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseReason::Accepted => "ACCEPTED",
            ResponseReason::Rejected => "REJECTED",
            ResponseReason::InvalidRequest => "Invalid request",
            ResponseReason::Unauthorized => "UNAUTHORIZED",
            ResponseReason::UnrecognizedSessionSecret => "UNRECOGNIZED_SESSION_SECRET",
            ResponseReason::AuthenticationSysFail => "AUTHENTICATION_SYS_FAIL",
            ResponseReason::AuthenticationDenied => "AUTHENTICATION_DENIED",
            ResponseReason::SessionManagerFail => "SESSION_MANAGER_FAIL",
            ResponseReason::Timeout => "TIMEOUT",
            ResponseReason::UnknownJob => "UNKNOWN_JOB",
        }
    }
}

/// Response envelope sent back for every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub reason: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl Response {
    pub fn ok(reason: ResponseReason, message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            reason: reason.as_str().to_string(),
            message: message.into(),
            data,
        }
    }

    pub fn fail(reason: ResponseReason, message: impl Into<String>, data: Value) -> Self {
        Self {
            success: false,
            reason: reason.as_str().to_string(),
            message: message.into(),
            data,
        }
    }

    /// The typed response for a message that matched no registered request
    /// type, echoing the payload back to the sender.
    pub fn invalid_message(original: Value) -> Self {
        Self::fail(
            ResponseReason::InvalidRequest,
            "unrecognized message",
            json!({ "content": original }),
        )
    }
}

/// SESSION_INIT: authenticate and obtain a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInitMessage {
    pub username: String,
    pub user_secret: String,
}

/// The per-model body of a job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPayload {
    pub version: f64,
    pub output: String,
    pub parameters: HashMap<String, Parameter>,
}

fn default_cpus() -> u32 {
    4
}

fn default_memory() -> u64 {
    500_000_000
}

/// Job submission: run a model. Recognized by shape rather than an `event`
/// tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelExecRequest {
    /// Single-entry map of model name to its payload.
    pub model: HashMap<String, ModelPayload>,
    #[serde(rename = "session-secret")]
    pub session_secret: String,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_memory")]
    pub memory: u64,
    #[serde(rename = "allocation-paradigm", default)]
    pub allocation_paradigm: AllocationParadigm,
    #[serde(rename = "config-data-id", default, skip_serializing_if = "Option::is_none")]
    pub config_data_id: Option<String>,
}

/// UPDATE: mutate an active job's permitted fields, or (as a server push)
/// notify the client of a status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    pub object_type: String,
    pub object_id: String,
    pub updated_data: HashMap<String, String>,
    pub digest: String,
}

impl UpdateMessage {
    /// Render with the `event` tag for the wire.
    pub fn to_wire(&self) -> Value {
        json!({
            "event": MessageEvent::Update.as_str(),
            "object_type": self.object_type,
            "object_id": self.object_id,
            "updated_data": self.updated_data,
            "digest": self.digest,
        })
    }
}

/// Acknowledgement of an UPDATE, correlated by digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateAck {
    pub digest: String,
    pub object_found: bool,
    pub success: bool,
}

/// JOB_CONTROL actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobControlAction {
    Stop,
    Release,
    Restart,
}

/// JOB_CONTROL: stop, release, or restart a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobControlRequest {
    pub action: JobControlAction,
    pub job_id: String,
    #[serde(rename = "session-secret")]
    pub session_secret: String,
}

/// JOB_INFO: fetch a job's record or just its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfoRequest {
    pub job_id: String,
    #[serde(default)]
    pub status_only: bool,
    #[serde(rename = "session-secret")]
    pub session_secret: String,
}

/// JOB_LIST: list job ids, optionally only active ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobListRequest {
    #[serde(default)]
    pub only_active: bool,
    #[serde(rename = "session-secret")]
    pub session_secret: String,
}

/// A parsed client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    SessionInit(SessionInitMessage),
    ModelExec(ModelExecRequest),
    Update(UpdateMessage),
    JobControl(JobControlRequest),
    JobInfo(JobInfoRequest),
    JobList(JobListRequest),
    UpdateAck(UpdateAck),
}

/// Parse an incoming frame against the registered request types, in declared
/// precedence. Returns the invalid-message response when nothing matches.
pub fn parse_client_message(text: &str) -> std::result::Result<ClientMessage, Response> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return Err(Response::invalid_message(Value::String(text.to_string()))),
    };

    if let Some(event) = value.get("event").and_then(Value::as_str) {
        let parsed = match event {
            "SESSION_INIT" => serde_json::from_value(value.clone())
                .map(ClientMessage::SessionInit)
                .ok(),
            "NWM_MAAS_REQUEST" => serde_json::from_value(value.clone())
                .map(ClientMessage::ModelExec)
                .ok(),
            "UPDATE" => serde_json::from_value(value.clone())
                .map(ClientMessage::Update)
                .ok(),
            "JOB_CONTROL" => serde_json::from_value(value.clone())
                .map(ClientMessage::JobControl)
                .ok(),
            "JOB_INFO" => serde_json::from_value(value.clone())
                .map(ClientMessage::JobInfo)
                .ok(),
            "JOB_LIST" => serde_json::from_value(value.clone())
                .map(ClientMessage::JobList)
                .ok(),
            _ => None,
        };
        return parsed.ok_or_else(|| Response::invalid_message(value));
    }

    // Untagged shapes, in precedence order: job submissions, then update
    // acknowledgements.
    if value.get("model").is_some() && value.get("session-secret").is_some() {
        if let Ok(request) = serde_json::from_value(value.clone()) {
            return Ok(ClientMessage::ModelExec(request));
        }
    }
    if value.get("digest").is_some() && value.get("success").is_some() {
        if let Ok(ack) = serde_json::from_value(value.clone()) {
            return Ok(ClientMessage::UpdateAck(ack));
        }
    }
    Err(Response::invalid_message(value))
}
