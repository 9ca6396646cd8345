//! Job domain model - one matrix combination x one parallel shard of a step

use crate::core::state::JobState;
use crate::core::step::{Plugin, Retry, SoftFail, StepKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trigger target carried by trigger jobs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerTarget {
    pub pipeline: String,
    pub build: Option<serde_json::Value>,
    pub is_async: bool,
}

/// An executable unit produced by the planner
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub kind: StepKind,
    /// Label after matrix substitution
    pub name: String,
    /// Step key; shared by every shard and matrix combination of the step
    pub key: Option<String>,
    /// Key of the enclosing group, if any
    pub group_key: Option<String>,
    pub group: Option<String>,

    pub commands: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub plugins: Vec<Plugin>,
    pub agent_query_rules: Vec<String>,
    pub artifact_paths: Vec<String>,
    pub timeout_minutes: Option<u32>,
    pub soft_fail: SoftFail,
    pub retry_policy: Option<Retry>,

    pub parallel_index: u32,
    pub parallel_total: u32,
    pub matrix_values: BTreeMap<String, String>,

    pub depends_on: Vec<String>,
    /// Run even when any dependency ends unsuccessfully
    pub allow_dep_fail: bool,
    /// `depends_on` keys declared with `allow_failure: true`
    pub allow_failure_keys: Vec<String>,

    pub concurrency_group: Option<String>,
    pub concurrency_limit: Option<u32>,

    pub trigger: Option<TriggerTarget>,

    pub state: JobState,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A pending job of the given kind with a fresh id
    pub fn new(kind: StepKind, name: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            kind,
            name: name.into(),
            key: None,
            group_key: None,
            group: None,
            commands: Vec::new(),
            env: BTreeMap::new(),
            plugins: Vec::new(),
            agent_query_rules: Vec::new(),
            artifact_paths: Vec::new(),
            timeout_minutes: None,
            soft_fail: SoftFail::None,
            retry_policy: None,
            parallel_index: 0,
            parallel_total: 0,
            matrix_values: BTreeMap::new(),
            depends_on: Vec::new(),
            allow_dep_fail: false,
            allow_failure_keys: Vec::new(),
            concurrency_group: None,
            concurrency_limit: None,
            trigger: None,
            state: JobState::Pending,
            exit_code: None,
            started_at: None,
            ended_at: None,
        }
    }

    /// Whether the job answers to a `depends_on` key
    pub fn matches_key(&self, key: &str) -> bool {
        self.key.as_deref() == Some(key) || self.group_key.as_deref() == Some(key)
    }

    /// Whether an unsuccessful `dependency` still lets this job run
    pub fn tolerates_failure_of(&self, dependency: &Job) -> bool {
        self.allow_dep_fail
            || self
                .allow_failure_keys
                .iter()
                .any(|key| dependency.matches_key(key))
    }

    /// Whether the job is handed to the agent (as opposed to resolved by the scheduler)
    pub fn is_executable(&self) -> bool {
        self.kind == StepKind::Command
    }

    /// Exit status of `exit_code` after applying the soft-fail policy
    pub fn state_for_exit(&self, exit_code: i32) -> JobState {
        if exit_code == 0 || self.soft_fail.allows(exit_code) {
            JobState::Passed
        } else {
            JobState::Failed
        }
    }

    /// Wall-clock duration, if the job both started and ended
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
