//! Job descriptors handed to the agent

use crate::core::{Job, Plugin};
use crate::server::state::BuildContext;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Token the agent presents back on job-scoped requests
pub const JOB_TOKEN: &str = "local-job-token";

/// Upper bound on a single log chunk the agent will upload
pub const CHUNKS_MAX_SIZE_BYTES: u64 = 1024 * 1024;

/// The agent refuses jobs with an empty repository, so one is always set
pub const REPO_SENTINEL: &str = "file:///dev/null";

#[derive(Debug, Clone, Serialize)]
pub struct StepPayload {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Value>,
}

/// What the agent needs to run a job
#[derive(Debug, Clone, Serialize)]
pub struct JobDescriptor {
    pub id: String,
    pub endpoint: String,
    pub state: String,
    pub env: BTreeMap<String, String>,
    pub step: StepPayload,
    pub token: String,
    pub chunks_max_size_bytes: u64,
}

impl JobDescriptor {
    pub fn new(job: &Job, build: &BuildContext, state: &str) -> Self {
        let plugins = plugins_json(&job.plugins);
        Self {
            id: job.id.to_string(),
            endpoint: build.endpoint.clone(),
            state: state.to_string(),
            env: job_env(job, build),
            step: StepPayload {
                command: job.commands.join("\n"),
                plugins,
            },
            token: JOB_TOKEN.to_string(),
            chunks_max_size_bytes: CHUNKS_MAX_SIZE_BYTES,
        }
    }
}

/// Plugins in the agent's list-of-single-key-objects form
fn plugins_json(plugins: &[Plugin]) -> Option<Value> {
    if plugins.is_empty() {
        return None;
    }
    let list = plugins
        .iter()
        .map(|plugin| match &plugin.config {
            Some(config) => {
                let mut entry = serde_json::Map::new();
                entry.insert(plugin.name.clone(), config.clone());
                Value::Object(entry)
            }
            None => Value::String(plugin.name.clone()),
        })
        .collect();
    Some(Value::Array(list))
}

/// Standard agent variables with the job's own env merged over them
pub fn job_env(job: &Job, build: &BuildContext) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        env.insert(key.to_string(), value);
    };

    set("BUILDKITE", "true".into());
    set("CI", "true".into());
    set("BUILDKITE_ORGANIZATION_SLUG", build.organization_slug.clone());
    set("BUILDKITE_PIPELINE_SLUG", build.pipeline_slug.clone());
    set("BUILDKITE_PIPELINE_NAME", build.pipeline_slug.clone());
    set("BUILDKITE_REPO", REPO_SENTINEL.into());
    set("BUILDKITE_BRANCH", build.branch.clone());
    set("BUILDKITE_COMMIT", build.commit.clone());
    set("BUILDKITE_BUILD_ID", build.build_id.clone());
    set("BUILDKITE_BUILD_NUMBER", build.build_number.to_string());
    set("BUILDKITE_JOB_ID", job.id.to_string());
    set("BUILDKITE_LABEL", job.name.clone());
    set("BUILDKITE_COMMAND", job.commands.join("\n"));
    set("BUILDKITE_RETRY_COUNT", "0".into());
    set("BUILDKITE_SOURCE", "local".into());
    set("BUILDKITE_SKIP_CHECKOUT", "true".into());
    set(
        "BUILDKITE_BUILD_CHECKOUT_PATH",
        build.checkout_dir.display().to_string(),
    );

    if let Some(key) = &job.key {
        set("BUILDKITE_STEP_KEY", key.clone());
    }
    if let Some(plugins) = plugins_json(&job.plugins) {
        set("BUILDKITE_PLUGINS", plugins.to_string());
    }
    if !job.artifact_paths.is_empty() {
        set("BUILDKITE_ARTIFACT_PATHS", job.artifact_paths.join(";"));
    }
    if let Some(minutes) = job.timeout_minutes {
        set("BUILDKITE_TIMEOUT", minutes.to_string());
    }

    env.extend(job.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}
