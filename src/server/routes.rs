//! Route table. Every route is served both at the root and under `/v3`,
//! which is where the agent's default endpoint points.

use crate::server::handlers::{agent, jobs, uploads};
use crate::server::state::ServerState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Per-request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// API version prefix the agent talks to
pub const API_PREFIX: &str = "/v3";

#[allow(deprecated)]
pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .merge(protocol_routes())
        .nest(API_PREFIX, protocol_routes())
        .with_state(state)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
}

fn protocol_routes() -> Router<Arc<ServerState>> {
    Router::new()
        .merge(agent_routes())
        .merge(job_routes())
        .merge(upload_routes())
}

fn agent_routes() -> Router<Arc<ServerState>> {
    Router::new()
        .route("/register", post(agent::register))
        .route("/connect", post(agent::connect))
        .route("/disconnect", post(agent::disconnect))
        .route("/ping", get(agent::ping).post(agent::ping))
        .route("/heartbeat", post(agent::heartbeat))
        .route("/meta", get(agent::meta))
}

fn job_routes() -> Router<Arc<ServerState>> {
    Router::new()
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/accept", post(jobs::accept).put(jobs::accept))
        .route("/jobs/{id}/start", post(jobs::start).put(jobs::start))
        .route("/jobs/{id}/finish", post(jobs::finish).put(jobs::finish))
        .route("/jobs/{id}/chunks", post(jobs::discard))
        .route("/jobs/{id}/log", post(jobs::discard))
        .route("/jobs/{id}/annotations", post(jobs::discard))
        .route(
            "/jobs/{id}/artifacts",
            get(jobs::list_artifacts).post(jobs::discard).put(jobs::discard),
        )
        .route(
            "/jobs/{id}/artifacts/{*rest}",
            get(jobs::list_artifacts).post(jobs::discard).put(jobs::discard),
        )
        .route("/jobs/{id}/data/set", post(jobs::set_meta_data))
        .route("/jobs/{id}/data/get", post(jobs::get_meta_data))
        .route("/jobs/{id}/data/exists", post(jobs::meta_data_exists))
        .route("/jobs/{id}/data/keys", post(jobs::meta_data_keys).get(jobs::meta_data_keys))
}

fn upload_routes() -> Router<Arc<ServerState>> {
    Router::new()
        .route("/jobs/{id}/pipelines", post(uploads::upload_for_job))
        .route("/jobs/{id}/pipelines/{uuid}", get(uploads::upload_status))
        .route("/pipelines", post(uploads::upload_detached))
        .route("/pipelines/{id}", post(uploads::upload_after))
        .route(
            "/artifacts",
            get(jobs::list_artifacts).post(uploads::store_artifact).put(uploads::store_artifact),
        )
        .route(
            "/artifacts/{*rest}",
            get(jobs::list_artifacts).post(uploads::store_artifact).put(uploads::store_artifact),
        )
}

