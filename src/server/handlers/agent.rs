//! Agent session endpoints: registration, polling and liveness

use crate::server::descriptor::JobDescriptor;
use crate::server::error::Result;
use crate::server::handlers::json_body;
use crate::server::state::{DispatchState, ServerState};
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Seconds between agent polls
pub const PING_INTERVAL: u64 = 1;
pub const JOB_STATUS_INTERVAL: u64 = 1;
pub const HEARTBEAT_INTERVAL: u64 = 60;

#[derive(Debug, Default, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub id: String,
    pub name: String,
    pub access_token: String,
    pub endpoint: String,
    pub ping_interval: u64,
    pub job_status_interval: u64,
    pub heartbeat_interval: u64,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub job: Option<JobDescriptor>,
}

pub async fn register(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<Json<RegisterResponse>> {
    let request: RegisterRequest = json_body(&body)?;
    let name = request
        .name
        .or(request.hostname)
        .unwrap_or_else(|| "local-agent".to_string());

    let agent = state.register_agent(&name);
    info!(agent = %agent.id, name = %agent.name, "agent registered");

    Ok(Json(RegisterResponse {
        id: agent.id,
        name: agent.name,
        access_token: agent.access_token,
        endpoint: state.build.endpoint.clone(),
        ping_interval: PING_INTERVAL,
        job_status_interval: JOB_STATUS_INTERVAL,
        heartbeat_interval: HEARTBEAT_INTERVAL,
    }))
}

pub async fn connect(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Json<Value> {
    debug!(agent = %state.agent_for(&headers), "agent connected");
    Json(json!({ "connected": true }))
}

pub async fn disconnect(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Json<Value> {
    debug!(agent = %state.agent_for(&headers), "agent disconnected");
    Json(json!({}))
}

/// Hand out at most one queued job
pub async fn ping(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Json<PingResponse> {
    let Some(job) = state.scheduler.next_job().await else {
        return Json(PingResponse { job: None });
    };

    let agent = state.agent_for(&headers);
    state.record_assignment(&job.id, &agent);
    debug!(job = %job.id, %agent, "job assigned");

    let descriptor = JobDescriptor::new(&job, &state.build, DispatchState::Assigned.as_str());
    Json(PingResponse {
        job: Some(descriptor),
    })
}

pub async fn heartbeat() -> Json<Value> {
    Json(json!({ "heartbeat": "ok" }))
}

pub async fn meta() -> Json<Value> {
    Json(json!({ "version": "local" }))
}
