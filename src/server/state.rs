//! Shared state of the protocol server

use crate::core::JobId;
use crate::execution::Scheduler;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Agent id used when a request carries no known token
pub const UNKNOWN_AGENT: &str = "unknown";

/// Facts about the local build that every job descriptor carries
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub build_id: String,
    pub build_number: u64,
    pub organization_slug: String,
    pub pipeline_slug: String,
    pub branch: String,
    pub commit: String,
    pub build_dir: PathBuf,
    pub checkout_dir: PathBuf,
    /// Base URL agents talk to, filled in once the server is bound
    pub endpoint: String,
}

impl BuildContext {
    pub fn new(
        build_dir: impl Into<PathBuf>,
        checkout_dir: impl Into<PathBuf>,
        branch: impl Into<String>,
        commit: impl Into<String>,
    ) -> Self {
        let build_dir = build_dir.into();
        Self {
            build_id: Uuid::new_v4().to_string(),
            build_number: 1,
            organization_slug: "local".to_string(),
            pipeline_slug: slug_for(&build_dir),
            branch: branch.into(),
            commit: commit.into(),
            build_dir,
            checkout_dir: checkout_dir.into(),
            endpoint: String::new(),
        }
    }
}

/// Lower-case, dash-separated slug of a directory's name
pub fn slug_for(dir: &Path) -> String {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let slug = name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "local".to_string()
    } else {
        slug
    }
}

/// A registered agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub access_token: String,
}

/// Where a handed-out job is in the agent's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Assigned,
    Accepted,
    Running,
    Completed,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchState::Assigned => "assigned",
            DispatchState::Accepted => "accepted",
            DispatchState::Running => "running",
            DispatchState::Completed => "finished",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatch {
    pub agent_id: String,
    pub state: DispatchState,
    pub assigned_at: Instant,
}

/// State shared by every handler
pub struct ServerState {
    pub scheduler: Arc<Scheduler>,
    pub build: BuildContext,
    agents: Mutex<HashMap<String, AgentRecord>>,
    dispatch: Mutex<HashMap<JobId, Dispatch>>,
    meta_data: Mutex<BTreeMap<String, String>>,
}

impl ServerState {
    pub fn new(scheduler: Arc<Scheduler>, build: BuildContext) -> Self {
        Self {
            scheduler,
            build,
            agents: Mutex::new(HashMap::new()),
            dispatch: Mutex::new(HashMap::new()),
            meta_data: Mutex::new(BTreeMap::new()),
        }
    }

    /// Mint an id and access token for a registering agent
    pub fn register_agent(&self, name: &str) -> AgentRecord {
        let record = AgentRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            access_token: Uuid::new_v4().simple().to_string(),
        };
        if let Ok(mut agents) = self.agents.lock() {
            agents.insert(record.access_token.clone(), record.clone());
        }
        record
    }

    /// Agent behind an `Authorization: Token <t>` header
    pub fn agent_for(&self, headers: &HeaderMap) -> String {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Token "))
            .map(str::trim);
        token
            .and_then(|t| {
                self.agents
                    .lock()
                    .ok()
                    .and_then(|agents| agents.get(t).map(|a| a.id.clone()))
            })
            .unwrap_or_else(|| UNKNOWN_AGENT.to_string())
    }

    pub fn agents(&self) -> Vec<AgentRecord> {
        self.agents
            .lock()
            .map(|agents| agents.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record_assignment(&self, job: &JobId, agent_id: &str) {
        if let Ok(mut dispatch) = self.dispatch.lock() {
            dispatch.insert(
                job.clone(),
                Dispatch {
                    agent_id: agent_id.to_string(),
                    state: DispatchState::Assigned,
                    assigned_at: Instant::now(),
                },
            );
        }
    }

    /// Advance a job's dispatch state. Jobs never handed out through a ping
    /// are tracked from here on, attributed to `agent_id`.
    pub fn advance(&self, job: &JobId, agent_id: &str, state: DispatchState) {
        if let Ok(mut dispatch) = self.dispatch.lock() {
            dispatch
                .entry(job.clone())
                .and_modify(|d| d.state = state)
                .or_insert_with(|| Dispatch {
                    agent_id: agent_id.to_string(),
                    state,
                    assigned_at: Instant::now(),
                });
        }
    }

    pub fn dispatch_state(&self, job: &JobId) -> Option<DispatchState> {
        self.dispatch
            .lock()
            .ok()
            .and_then(|d| d.get(job).map(|d| d.state))
    }

    /// `job_id -> agent_id` for every job handed out so far
    pub fn assignments(&self) -> BTreeMap<JobId, String> {
        self.dispatch
            .lock()
            .map(|d| {
                d.iter()
                    .map(|(job, dispatch)| (job.clone(), dispatch.agent_id.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Jobs handed out more than `timeout` ago and still not accepted
    pub fn unaccepted_since(&self, timeout: Duration) -> Vec<JobId> {
        self.dispatch
            .lock()
            .map(|d| {
                d.iter()
                    .filter(|(_, dispatch)| {
                        dispatch.state == DispatchState::Assigned
                            && dispatch.assigned_at.elapsed() >= timeout
                    })
                    .map(|(job, _)| job.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_meta_data(&self, key: &str, value: &str) {
        if let Ok(mut meta) = self.meta_data.lock() {
            meta.insert(key.to_string(), value.to_string());
        }
    }

    pub fn meta_data(&self, key: &str) -> Option<String> {
        self.meta_data.lock().ok().and_then(|m| m.get(key).cloned())
    }

    pub fn meta_data_keys(&self) -> Vec<String> {
        self.meta_data
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}
