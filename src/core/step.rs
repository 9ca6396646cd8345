//! Step domain model
//!
//! A [`Step`] is one entry of the `steps:` list exactly as the user wrote it,
//! after the loader has normalized the polymorphic YAML shapes. Steps expand
//! into one or more [`Job`](crate::core::Job)s during planning.

use serde::Serialize;
use std::collections::BTreeMap;

/// Kind of a step, as detected by the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Command,
    Wait,
    Block,
    Input,
    Trigger,
    Group,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Command => "command",
            StepKind::Wait => "wait",
            StepKind::Block => "block",
            StepKind::Input => "input",
            StepKind::Trigger => "trigger",
            StepKind::Group => "group",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command payload: `command:` as a scalar, or a list from `command:`/`commands:`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Command {
    Single(String),
    Multi(Vec<String>),
}

impl Command {
    /// The ordered command lines
    pub fn lines(&self) -> Vec<String> {
        match self {
            Command::Single(line) => vec![line.clone()],
            Command::Multi(lines) => lines.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Command::Single(line) => line.is_empty(),
            Command::Multi(lines) => lines.is_empty(),
        }
    }
}

/// One `depends_on` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub key: String,
    pub allow_failure: bool,
}

impl Dependency {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            allow_failure: false,
        }
    }
}

/// A plugin reference: `- docker#v5.0.0: { image: ... }`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plugin {
    pub name: String,
    pub config: Option<serde_json::Value>,
}

/// Matrix axes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MatrixShape {
    /// `matrix: [a, b, c]`, a single axis named `matrix`
    Linear(Vec<String>),
    /// `matrix: { setup: { os: [...], arch: [...] } }` or the bare mapping form
    Axes(BTreeMap<String, Vec<String>>),
}

/// Name of the implicit axis used by the single-dimension matrix form
pub const LINEAR_AXIS: &str = "matrix";

/// An `adjustments:` entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Adjustment {
    /// Combination this adjustment applies to
    pub with: BTreeMap<String, String>,
    pub skip: bool,
    pub soft_fail: Option<SoftFail>,
    pub env: BTreeMap<String, String>,
}

/// Matrix definition of a command step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Matrix {
    pub shape: MatrixShape,
    pub adjustments: Vec<Adjustment>,
}

impl Matrix {
    /// Axes in sorted name order
    pub fn axes(&self) -> Vec<(String, Vec<String>)> {
        match &self.shape {
            MatrixShape::Linear(values) => vec![(LINEAR_AXIS.to_string(), values.clone())],
            // BTreeMap iteration is already sorted
            MatrixShape::Axes(axes) => axes
                .iter()
                .map(|(name, values)| (name.clone(), values.clone()))
                .collect(),
        }
    }

    pub fn is_linear(&self) -> bool {
        matches!(self.shape, MatrixShape::Linear(_))
    }
}

/// Soft-fail policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub enum SoftFail {
    #[default]
    None,
    /// Every non-zero exit status counts as passed
    AllNonZero,
    /// Only these exit statuses count as passed
    Codes(Vec<i32>),
}

impl SoftFail {
    /// Whether a non-zero `exit_code` should be treated as passed
    pub fn allows(&self, exit_code: i32) -> bool {
        match self {
            SoftFail::None => false,
            SoftFail::AllNonZero => exit_code != 0,
            SoftFail::Codes(codes) => codes.contains(&exit_code),
        }
    }
}

/// Which exit statuses an automatic retry rule matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExitStatusMatch {
    Any,
    Codes(Vec<i32>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryRule {
    pub exit_status: ExitStatusMatch,
    pub signal_reason: Option<String>,
    pub limit: u32,
}

/// Default limit for `automatic: true`
pub const DEFAULT_RETRY_LIMIT: u32 = 2;

impl Default for RetryRule {
    fn default() -> Self {
        Self {
            exit_status: ExitStatusMatch::Any,
            signal_reason: None,
            limit: DEFAULT_RETRY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub enum AutomaticRetry {
    #[default]
    Off,
    Uniform(RetryRule),
    Rules(Vec<RetryRule>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualRetry {
    pub allowed: bool,
    pub permit_on_passed: bool,
    pub reason: Option<String>,
}

impl Default for ManualRetry {
    fn default() -> Self {
        Self {
            allowed: true,
            permit_on_passed: false,
            reason: None,
        }
    }
}

/// Retry policy. Carried onto jobs for display only; local runs never retry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Retry {
    pub automatic: AutomaticRetry,
    pub manual: ManualRetry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldOption {
    pub label: String,
    pub value: String,
}

/// A block/input step field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub key: String,
    pub text: String,
    pub hint: Option<String>,
    pub required: bool,
    pub default: Vec<String>,
    pub options: Vec<FieldOption>,
    pub multiple: bool,
}

/// A single step in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub kind: StepKind,

    /// Stable identifier other steps depend on
    pub key: Option<String>,
    pub label: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "if")]
    pub condition: Option<String>,
    pub branches: Option<String>,
    pub allowed_teams: Vec<String>,

    pub depends_on: Vec<Dependency>,
    pub allow_dependency_failure: bool,

    pub command: Option<Command>,
    pub env: BTreeMap<String, String>,
    pub plugins: Vec<Plugin>,

    pub parallelism: Option<u32>,
    pub matrix: Option<Matrix>,
    pub concurrency: Option<u32>,
    pub concurrency_group: Option<String>,

    pub agent_query_rules: Vec<String>,
    pub artifact_paths: Vec<String>,
    pub timeout_minutes: Option<u32>,
    pub retry: Option<Retry>,
    pub soft_fail: SoftFail,

    // wait
    pub continue_on_failure: bool,

    // block / input
    pub prompt: Option<String>,
    pub blocked_state: Option<String>,
    pub fields: Vec<Field>,

    // trigger
    pub trigger: Option<String>,
    pub build: Option<serde_json::Value>,
    #[serde(rename = "async")]
    pub is_async: bool,

    // group
    pub group: Option<String>,
    pub steps: Vec<Step>,
}

impl Step {
    /// An empty step of the given kind; the loader fills in the rest
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            key: None,
            label: None,
            name: None,
            condition: None,
            branches: None,
            allowed_teams: Vec::new(),
            depends_on: Vec::new(),
            allow_dependency_failure: false,
            command: None,
            env: BTreeMap::new(),
            plugins: Vec::new(),
            parallelism: None,
            matrix: None,
            concurrency: None,
            concurrency_group: None,
            agent_query_rules: Vec::new(),
            artifact_paths: Vec::new(),
            timeout_minutes: None,
            retry: None,
            soft_fail: SoftFail::None,
            continue_on_failure: false,
            prompt: None,
            blocked_state: None,
            fields: Vec::new(),
            trigger: None,
            build: None,
            is_async: false,
            group: None,
            steps: Vec::new(),
        }
    }

    /// Display name: label, then name, then the first command line, then the kind
    pub fn display_name(&self) -> String {
        self.label
            .clone()
            .or_else(|| self.name.clone())
            .or_else(|| self.group.clone())
            .or_else(|| self.trigger.clone())
            .or_else(|| {
                self.command
                    .as_ref()
                    .and_then(|c| c.lines().into_iter().next())
            })
            .unwrap_or_else(|| self.kind.to_string())
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.command.as_ref().map(Command::lines).unwrap_or_default()
    }
}
