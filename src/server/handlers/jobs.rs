//! Job lifecycle endpoints and job-scoped extras

use crate::core::JobId;
use crate::server::descriptor::JobDescriptor;
use crate::server::error::{ProtocolError, Result};
use crate::server::handlers::{find_job, json_body};
use crate::server::state::{DispatchState, ServerState};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default, Deserialize)]
pub struct FinishRequest {
    /// The agent sends this as a string
    #[serde(default)]
    pub exit_status: Option<Value>,
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub signal_reason: Option<String>,
}

impl FinishRequest {
    pub fn exit_code(&self) -> Result<i32> {
        match &self.exit_status {
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map_err(|_| ProtocolError::Parse(format!("exit_status {s:?} is not an integer"))),
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| ProtocolError::Parse(format!("exit_status {n} is out of range"))),
            Some(other) => Err(ProtocolError::Parse(format!(
                "exit_status must be a string, got {other}"
            ))),
            None => Err(ProtocolError::Parse("missing exit_status".to_string())),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MetaDataRequest {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

pub async fn get_job(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<JobDescriptor>> {
    let job = find_job(&state, &id).await?;
    let dispatch = state
        .dispatch_state(&job.id)
        .map(|d| d.as_str())
        .unwrap_or_else(|| job.state.as_str());
    Ok(Json(JobDescriptor::new(&job, &state.build, dispatch)))
}

/// Accept returns the bare descriptor, not the ping envelope
pub async fn accept(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<JobDescriptor>> {
    let job = find_job(&state, &id).await?;
    state.advance(&job.id, &state.agent_for(&headers), DispatchState::Accepted);
    debug!(job = %job.id, "job accepted");
    Ok(Json(JobDescriptor::new(
        &job,
        &state.build,
        DispatchState::Accepted.as_str(),
    )))
}

pub async fn start(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let id = JobId::from(id);
    state
        .scheduler
        .handle_assigned(&id)
        .await
        .map_err(|e| ProtocolError::NotFound(e.to_string()))?;
    state.advance(&id, &state.agent_for(&headers), DispatchState::Running);
    Ok(Json(json!({})))
}

pub async fn finish(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: FinishRequest = json_body(&body)?;
    let exit_code = request.exit_code()?;
    let id = JobId::from(id);

    let final_state = state
        .scheduler
        .handle_finished(&id, exit_code)
        .await
        .map_err(|e| ProtocolError::NotFound(e.to_string()))?;
    state.advance(&id, &state.agent_for(&headers), DispatchState::Completed);

    if let Some(signal) = &request.signal {
        info!(job = %id, %signal, reason = ?request.signal_reason, "job was signalled");
    }
    debug!(job = %id, exit_code, state = %final_state, "job finished by agent");
    Ok(Json(json!({})))
}

/// Log chunks, annotations and job artifacts are accepted and dropped
pub async fn discard(body: Bytes) -> Json<Value> {
    debug!(bytes = body.len(), "discarded upload");
    Json(json!({}))
}

pub async fn list_artifacts() -> Json<Value> {
    Json(json!([]))
}

pub async fn set_meta_data(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: MetaDataRequest = json_body(&body)?;
    if request.key.is_empty() {
        return Err(ProtocolError::Parse("meta-data key is required".to_string()));
    }
    let value = request.value.unwrap_or_default();
    debug!(job = %id, key = %request.key, "meta-data set");
    state.set_meta_data(&request.key, &value);
    Ok(Json(json!({})))
}

pub async fn get_meta_data(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: MetaDataRequest = json_body(&body)?;
    let value = state
        .meta_data(&request.key)
        .ok_or_else(|| ProtocolError::NotFound(format!("meta-data key {:?}", request.key)))?;
    Ok(Json(json!({ "key": request.key, "value": value })))
}

pub async fn meta_data_exists(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: MetaDataRequest = json_body(&body)?;
    Ok(Json(json!({ "exists": state.meta_data(&request.key).is_some() })))
}

pub async fn meta_data_keys(State(state): State<Arc<ServerState>>) -> Json<Vec<String>> {
    Json(state.meta_data_keys())
}
