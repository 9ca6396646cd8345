//! Dynamic pipeline uploads

use crate::core::{JobId, Pipeline};
use crate::server::error::{ProtocolError, Result};
use crate::server::state::ServerState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    response::Json,
};
use serde_json::{json, Value};
use serde_yaml::Value as Yaml;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parse an upload body: pipeline YAML, or an envelope whose `pipeline`
/// holds the pipeline as a mapping or as a YAML string.
pub fn parse_upload(body: &[u8]) -> Result<Pipeline> {
    let value: Yaml =
        serde_yaml::from_slice(body).map_err(|e| ProtocolError::Parse(e.to_string()))?;

    let pipeline = match &value {
        Yaml::Mapping(map) if map.get("steps").is_none() && map.get("pipeline").is_some() => {
            match map.get("pipeline") {
                Some(Yaml::String(text)) => serde_yaml::from_str(text)
                    .map_err(|e| ProtocolError::Parse(e.to_string()))?,
                Some(inner) => inner.clone(),
                None => value.clone(),
            }
        }
        _ => value,
    };

    Pipeline::from_value(&pipeline).map_err(|e| ProtocolError::Parse(e.to_string()))
}

async fn upload(state: &ServerState, anchor: Option<JobId>, body: &[u8]) -> Result<Json<Value>> {
    let pipeline = parse_upload(body).inspect_err(|e| warn!(error = %e, "rejected upload"))?;

    if let Some(anchor) = &anchor {
        if state.scheduler.graph().get(anchor).await.is_none() {
            return Err(ProtocolError::NotFound(format!("job {anchor}")));
        }
    }

    let inserted = state
        .scheduler
        .handle_upload(anchor.as_ref(), pipeline)
        .await
        .map_err(|e| ProtocolError::UploadPlan(e.to_string()))?;
    info!(anchor = ?anchor.as_ref().map(JobId::as_str), jobs = inserted.len(), "upload spliced");

    Ok(Json(json!({ "uploaded": true })))
}

/// `POST /jobs/{id}/pipelines`
pub async fn upload_for_job(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    upload(&state, Some(JobId::from(id)), &body).await
}

/// `POST /pipelines/{id}`
pub async fn upload_after(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    upload(&state, Some(JobId::from(id)), &body).await
}

/// `POST /pipelines`, appended without an anchor
pub async fn upload_detached(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<Json<Value>> {
    upload(&state, None, &body).await
}

/// Uploads are applied synchronously, so status polls always see them done
pub async fn upload_status(Path((_id, uuid)): Path<(String, String)>) -> Json<Value> {
    Json(json!({ "id": uuid, "state": "applied" }))
}

/// Artifact uploads are acknowledged and dropped
pub async fn store_artifact(body: Bytes) -> Json<Value> {
    debug!(bytes = body.len(), "discarded artifact");
    Json(json!({ "uploaded": true }))
}
