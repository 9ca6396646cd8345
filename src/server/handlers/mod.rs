//! Request handlers, grouped by the part of the protocol they serve

pub mod agent;
pub mod jobs;
pub mod uploads;

use crate::core::{Job, JobId};
use crate::server::error::{ProtocolError, Result};
use crate::server::state::ServerState;
use axum::body::Bytes;
use serde::de::DeserializeOwned;

/// Decode an optional JSON body; an empty body yields the default value
pub(crate) fn json_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ProtocolError::Parse(e.to_string()))
}

pub(crate) async fn find_job(state: &ServerState, id: &str) -> Result<Job> {
    state
        .scheduler
        .graph()
        .get(&JobId::from(id))
        .await
        .ok_or_else(|| ProtocolError::NotFound(format!("job {id}")))
}
