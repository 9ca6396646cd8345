//! Pipeline loading from YAML
//!
//! The pipeline language lets a single field carry several shapes
//! (`command:` as a scalar or a list, `depends_on:` as a key or a list of
//! `{step, allow_failure}` mappings, and so on). Everything is normalized here
//! so the planner only ever sees the typed model in [`crate::core::step`].

use crate::core::pipeline::Pipeline;
use crate::core::step::{
    Adjustment, AutomaticRetry, Command, Dependency, ExitStatusMatch, Field, FieldOption,
    ManualRetry, Matrix, MatrixShape, Plugin, Retry, RetryRule, SoftFail, Step, StepKind,
    DEFAULT_RETRY_LIMIT, LINEAR_AXIS,
};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading a pipeline
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("malformed step at {at}: {reason}")]
    MalformedStep { at: String, reason: String },

    #[error("unknown step kind at {at}: {kind}")]
    UnknownStepKind { at: String, kind: String },

    #[error("invalid matrix at {at}: {reason}")]
    MatrixShape { at: String, reason: String },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn malformed(at: &str, reason: impl Into<String>) -> LoadError {
    LoadError::MalformedStep {
        at: at.to_string(),
        reason: reason.into(),
    }
}

fn matrix_error(at: &str, reason: impl Into<String>) -> LoadError {
    LoadError::MatrixShape {
        at: at.to_string(),
        reason: reason.into(),
    }
}

type LoadResult<T> = Result<T, LoadError>;

/// Keys that decide a mapping step's kind, in priority order
const KIND_KEYS: [(&str, StepKind); 8] = [
    ("wait", StepKind::Wait),
    ("waiter", StepKind::Wait),
    ("block", StepKind::Block),
    ("input", StepKind::Input),
    ("trigger", StepKind::Trigger),
    ("group", StepKind::Group),
    ("command", StepKind::Command),
    ("commands", StepKind::Command),
];

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> LoadResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&content)
    }

    /// Parse a pipeline from a YAML string
    pub fn from_yaml(yaml: &str) -> LoadResult<Self> {
        Self::from_bytes(yaml.as_bytes())
    }

    /// Parse a pipeline from raw bytes, as received from an upload
    pub fn from_bytes(bytes: &[u8]) -> LoadResult<Self> {
        let value: Value = serde_yaml::from_slice(bytes)?;
        Self::from_value(&value)
    }

    /// Build a pipeline from an already-parsed YAML document
    pub fn from_value(value: &Value) -> LoadResult<Self> {
        let (env, agents, steps) = match value {
            Value::Mapping(map) => (
                string_map(map.get("env"), "env")?,
                query_rules(map.get("agents"), "agents")?,
                map.get("steps"),
            ),
            // A bare list is shorthand for `steps:`
            Value::Sequence(_) => (BTreeMap::new(), Vec::new(), Some(value)),
            _ => return Err(malformed("pipeline", "expected a mapping with `steps`")),
        };

        let steps = match steps {
            Some(steps) => parse_steps(steps, "steps")?,
            None => return Err(malformed("pipeline", "missing `steps`")),
        };
        if steps.is_empty() {
            return Err(malformed("steps", "pipeline has no steps"));
        }

        Ok(Pipeline {
            env,
            agent_query_rules: agents,
            steps,
        })
    }
}

fn parse_steps(value: &Value, at: &str) -> LoadResult<Vec<Step>> {
    let items = match value {
        Value::Sequence(items) => items,
        Value::Null => return Ok(Vec::new()),
        _ => return Err(malformed(at, "`steps` must be a list")),
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| parse_step(item, &format!("{at}[{index}]")))
        .collect()
}

fn parse_step(value: &Value, at: &str) -> LoadResult<Step> {
    match value {
        Value::String(s) => match s.as_str() {
            "wait" | "waiter" => Ok(Step::new(StepKind::Wait)),
            "block" => Ok(Step::new(StepKind::Block)),
            "input" => Ok(Step::new(StepKind::Input)),
            other => Err(LoadError::UnknownStepKind {
                at: at.to_string(),
                kind: other.to_string(),
            }),
        },
        Value::Mapping(map) => parse_mapping_step(map, at),
        Value::Null => Err(malformed(at, "empty step")),
        _ => Err(malformed(at, "a step must be a string or a mapping")),
    }
}

fn detect_kind(map: &Mapping, at: &str) -> LoadResult<StepKind> {
    if let Some(kind) = map.get("type") {
        let kind = scalar_string(kind).unwrap_or_default();
        return match kind.as_str() {
            "script" | "command" | "commands" => Ok(StepKind::Command),
            "wait" | "waiter" => Ok(StepKind::Wait),
            "block" | "manual" => Ok(StepKind::Block),
            "input" => Ok(StepKind::Input),
            "trigger" => Ok(StepKind::Trigger),
            "group" => Ok(StepKind::Group),
            _ => Err(LoadError::UnknownStepKind {
                at: at.to_string(),
                kind,
            }),
        };
    }

    if let Some((_, kind)) = KIND_KEYS.iter().find(|(key, _)| map.contains_key(*key)) {
        return Ok(*kind);
    }

    // Plugin-only steps and label-only steps are commands
    if ["label", "name", "plugins"].iter().any(|k| map.contains_key(*k)) {
        return Ok(StepKind::Command);
    }

    Err(malformed(at, "cannot determine step kind"))
}

fn parse_mapping_step(map: &Mapping, at: &str) -> LoadResult<Step> {
    let kind = detect_kind(map, at)?;
    let mut step = Step::new(kind);

    step.key = ["key", "id", "identifier"]
        .iter()
        .find_map(|k| map.get(*k).and_then(scalar_string));
    step.label = opt_string(map, "label", at)?;
    step.name = opt_string(map, "name", at)?;
    step.condition = opt_string(map, "if", at)?;
    step.branches = match map.get("branches") {
        None | Some(Value::Null) => None,
        Some(v) => Some(string_list(Some(v), at, "branches")?.join(" ")),
    };
    step.allowed_teams = string_list(map.get("allowed_teams"), at, "allowed_teams")?;
    step.depends_on = dependencies(map.get("depends_on"), at)?;
    step.allow_dependency_failure = bool_field(map, "allow_dependency_failure", at)?;

    match kind {
        StepKind::Command => parse_command_fields(map, at, &mut step)?,
        StepKind::Wait => {
            if step.label.is_none() {
                step.label = ["wait", "waiter"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(scalar_string));
            }
            step.continue_on_failure = bool_field(map, "continue_on_failure", at)?;
        }
        StepKind::Block | StepKind::Input => {
            let discriminator = if kind == StepKind::Block { "block" } else { "input" };
            if step.label.is_none() {
                step.label = map.get(discriminator).and_then(scalar_string);
            }
            step.prompt = opt_string(map, "prompt", at)?;
            step.blocked_state = opt_string(map, "blocked_state", at)?;
            step.fields = fields(map.get("fields"), at)?;
        }
        StepKind::Trigger => {
            step.trigger = map.get("trigger").and_then(scalar_string);
            if step.trigger.as_deref().map_or(true, str::is_empty) {
                return Err(malformed(at, "`trigger` must name a pipeline"));
            }
            step.build = match map.get("build") {
                None | Some(Value::Null) => None,
                Some(build) => Some(to_json(build, at, "build")?),
            };
            step.is_async = bool_field(map, "async", at)?;
        }
        StepKind::Group => {
            if step.label.is_none() {
                step.label = map.get("group").and_then(scalar_string);
            }
            step.group = step.label.clone();
            let inner = map
                .get("steps")
                .ok_or_else(|| malformed(at, "group has no `steps`"))?;
            step.steps = parse_steps(inner, &format!("{at}.steps"))?;
            if step.steps.is_empty() {
                return Err(malformed(at, "group has no steps"));
            }
            if step.steps.iter().any(|s| s.kind == StepKind::Group) {
                return Err(malformed(at, "groups cannot be nested"));
            }
        }
    }

    Ok(step)
}

fn parse_command_fields(map: &Mapping, at: &str, step: &mut Step) -> LoadResult<()> {
    step.command = command_payload(map, at)?;
    step.env = string_map(map.get("env"), at)?;
    step.plugins = plugins(map.get("plugins"), at)?;
    step.parallelism = positive_u32(map.get("parallelism"), at, "parallelism")?;
    step.matrix = match map.get("matrix") {
        None | Some(Value::Null) => None,
        Some(matrix) => Some(parse_matrix(matrix, &format!("{at}.matrix"))?),
    };
    step.concurrency = positive_u32(map.get("concurrency"), at, "concurrency")?;
    step.concurrency_group = opt_string(map, "concurrency_group", at)?;
    step.agent_query_rules = query_rules(map.get("agents"), at)?;
    step.artifact_paths = string_list(map.get("artifact_paths"), at, "artifact_paths")?;
    step.timeout_minutes = match map.get("timeout_in_minutes") {
        Some(v) => positive_u32(Some(v), at, "timeout_in_minutes")?,
        None => positive_u32(map.get("timeout_minutes"), at, "timeout_minutes")?,
    };
    step.retry = match map.get("retry") {
        None | Some(Value::Null) => None,
        Some(retry) => Some(parse_retry(retry, at)?),
    };
    step.soft_fail = match map.get("soft_fail") {
        None => SoftFail::None,
        Some(v) => parse_soft_fail(v, at)?,
    };
    Ok(())
}

/// `command:` and `commands:` merged in source order
fn command_payload(map: &Mapping, at: &str) -> LoadResult<Option<Command>> {
    let mut lines = Vec::new();
    let mut single = None;
    let mut seen = 0;

    for (key, value) in map {
        let key = key.as_str().unwrap_or_default();
        if key != "command" && key != "commands" {
            continue;
        }
        seen += 1;
        match value {
            Value::Null => {}
            Value::Sequence(_) => lines.extend(string_list(Some(value), at, key)?),
            other => match scalar_string(other) {
                Some(line) if key == "command" => {
                    single = Some(line.clone());
                    lines.push(line);
                }
                Some(line) => lines.push(line),
                None => return Err(malformed(at, format!("`{key}` must be a string or a list"))),
            },
        }
    }

    Ok(match (seen, single, lines.len()) {
        (0, _, _) => None,
        (_, _, 0) => None,
        (1, Some(line), 1) => Some(Command::Single(line)),
        _ => Some(Command::Multi(lines)),
    })
}

fn dependencies(value: Option<&Value>, at: &str) -> LoadResult<Vec<Dependency>> {
    fn entry(value: &Value, at: &str) -> LoadResult<Option<Dependency>> {
        match value {
            Value::Null => Ok(None),
            Value::Mapping(map) => {
                let key = map
                    .get("step")
                    .or_else(|| map.get("key"))
                    .and_then(scalar_string)
                    .ok_or_else(|| malformed(at, "depends_on entry is missing `step`"))?;
                Ok(Some(Dependency {
                    key,
                    allow_failure: bool_field(map, "allow_failure", at)?,
                }))
            }
            other => scalar_string(other)
                .map(|key| Some(Dependency::new(key)))
                .ok_or_else(|| malformed(at, "invalid depends_on entry")),
        }
    }

    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(items)) => {
            let mut deps = Vec::new();
            for item in items {
                if let Some(dep) = entry(item, at)? {
                    deps.push(dep);
                }
            }
            Ok(deps)
        }
        Some(other) => Ok(entry(other, at)?.into_iter().collect()),
    }
}

fn plugins(value: Option<&Value>, at: &str) -> LoadResult<Vec<Plugin>> {
    fn from_pair(name: &Value, config: &Value, at: &str) -> LoadResult<Plugin> {
        let name = scalar_string(name).ok_or_else(|| malformed(at, "plugin name must be a string"))?;
        let config = match config {
            Value::Null => None,
            other => Some(to_json(other, at, "plugins")?),
        };
        Ok(Plugin { name, config })
    }

    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|item| match item {
                Value::Mapping(map) if map.len() == 1 => {
                    let (name, config) = map
                        .iter()
                        .next()
                        .ok_or_else(|| malformed(at, "empty plugin entry"))?;
                    from_pair(name, config, at)
                }
                Value::Mapping(_) => Err(malformed(at, "plugin entries must have exactly one key")),
                other => from_pair(other, &Value::Null, at),
            })
            .collect(),
        // Legacy form: a single mapping of name -> config
        Some(Value::Mapping(map)) => map
            .iter()
            .map(|(name, config)| from_pair(name, config, at))
            .collect(),
        Some(_) => Err(malformed(at, "`plugins` must be a list")),
    }
}

fn parse_matrix(value: &Value, at: &str) -> LoadResult<Matrix> {
    let (setup, adjustments) = match value {
        Value::Sequence(_) => (value, None),
        Value::Mapping(map) => match map.get("setup") {
            Some(setup) => (setup, map.get("adjustments")),
            None => (value, map.get("adjustments")),
        },
        _ => return Err(matrix_error(at, "expected a list or a mapping")),
    };

    let shape = match setup {
        Value::Sequence(_) => {
            let values = matrix_values(setup, at, LINEAR_AXIS)?;
            MatrixShape::Linear(values)
        }
        Value::Mapping(axes) => {
            let mut parsed = BTreeMap::new();
            for (name, values) in axes {
                let name = scalar_string(name)
                    .ok_or_else(|| matrix_error(at, "axis names must be scalars"))?;
                if name == "adjustments" {
                    continue;
                }
                let values = matrix_values(values, at, &name)?;
                parsed.insert(name, values);
            }
            if parsed.is_empty() {
                return Err(matrix_error(at, "no axes"));
            }
            MatrixShape::Axes(parsed)
        }
        _ => return Err(matrix_error(at, "`setup` must be a list or a mapping")),
    };

    let linear = matches!(shape, MatrixShape::Linear(_));
    let adjustments = match adjustments {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|item| parse_adjustment(item, at, linear))
            .collect::<LoadResult<_>>()?,
        Some(_) => return Err(matrix_error(at, "`adjustments` must be a list")),
    };

    Ok(Matrix { shape, adjustments })
}

fn matrix_values(value: &Value, at: &str, axis: &str) -> LoadResult<Vec<String>> {
    let items = match value {
        Value::Sequence(items) => items,
        _ => return Err(matrix_error(at, format!("axis `{axis}` must be a list"))),
    };
    if items.is_empty() {
        return Err(matrix_error(at, format!("axis `{axis}` has no values")));
    }
    items
        .iter()
        .map(|v| {
            scalar_string(v)
                .ok_or_else(|| matrix_error(at, format!("axis `{axis}` values must be scalars")))
        })
        .collect()
}

fn parse_adjustment(value: &Value, at: &str, linear: bool) -> LoadResult<Adjustment> {
    let map = match value {
        Value::Mapping(map) => map,
        _ => return Err(matrix_error(at, "adjustments must be mappings")),
    };

    let with = match map.get("with") {
        Some(Value::Mapping(with)) => {
            let mut combination = BTreeMap::new();
            for (k, v) in with {
                match (scalar_string(k), scalar_string(v)) {
                    (Some(k), Some(v)) => combination.insert(k, v),
                    _ => return Err(matrix_error(at, "`with` values must be scalars")),
                };
            }
            combination
        }
        Some(scalar) if linear => match scalar_string(scalar) {
            Some(v) => BTreeMap::from([(LINEAR_AXIS.to_string(), v)]),
            None => return Err(matrix_error(at, "`with` must be a scalar")),
        },
        _ => return Err(matrix_error(at, "adjustment is missing `with`")),
    };

    let skip = match map.get("skip") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        // `skip: "reason"` skips too
        Some(Value::String(_)) => true,
        Some(_) => return Err(matrix_error(at, "`skip` must be a boolean or a reason")),
    };

    let soft_fail = match map.get("soft_fail") {
        None => None,
        Some(v) => Some(parse_soft_fail(v, at)?),
    };

    Ok(Adjustment {
        with,
        skip,
        soft_fail,
        env: string_map(map.get("env"), at)?,
    })
}

fn parse_soft_fail(value: &Value, at: &str) -> LoadResult<SoftFail> {
    match value {
        Value::Null | Value::Bool(false) => Ok(SoftFail::None),
        Value::Bool(true) => Ok(SoftFail::AllNonZero),
        Value::Sequence(items) => {
            let mut codes = Vec::new();
            for item in items {
                let status = match item {
                    Value::Mapping(map) => map.get("exit_status").cloned().unwrap_or(Value::Null),
                    other => other.clone(),
                };
                match exit_status(&status, at)? {
                    ExitStatusMatch::Any => return Ok(SoftFail::AllNonZero),
                    ExitStatusMatch::Codes(more) => codes.extend(more),
                }
            }
            Ok(SoftFail::Codes(codes))
        }
        Value::String(s) if s == "true" => Ok(SoftFail::AllNonZero),
        Value::String(s) if s == "false" => Ok(SoftFail::None),
        _ => Err(malformed(at, "`soft_fail` must be a boolean or a list of exit statuses")),
    }
}

fn exit_status(value: &Value, at: &str) -> LoadResult<ExitStatusMatch> {
    match value {
        Value::String(s) if s == "*" => Ok(ExitStatusMatch::Any),
        Value::Sequence(items) => items
            .iter()
            .map(|v| int(v).ok_or_else(|| malformed(at, "exit statuses must be integers")))
            .collect::<LoadResult<Vec<_>>>()
            .map(ExitStatusMatch::Codes),
        other => int(other)
            .map(|code| ExitStatusMatch::Codes(vec![code]))
            .ok_or_else(|| malformed(at, "exit_status must be an integer or \"*\"")),
    }
}

fn parse_retry(value: &Value, at: &str) -> LoadResult<Retry> {
    let map = match value {
        Value::Mapping(map) => map,
        _ => return Err(malformed(at, "`retry` must be a mapping")),
    };

    let automatic = match map.get("automatic") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => AutomaticRetry::Off,
        Some(Value::Bool(true)) => AutomaticRetry::Uniform(RetryRule::default()),
        Some(Value::Mapping(rule)) => AutomaticRetry::Uniform(retry_rule(rule, at)?),
        Some(Value::Sequence(rules)) => AutomaticRetry::Rules(
            rules
                .iter()
                .map(|rule| match rule {
                    Value::Mapping(rule) => retry_rule(rule, at),
                    _ => Err(malformed(at, "automatic retry rules must be mappings")),
                })
                .collect::<LoadResult<_>>()?,
        ),
        Some(_) => return Err(malformed(at, "invalid `retry.automatic`")),
    };

    let manual = match map.get("manual") {
        None | Some(Value::Null) => ManualRetry::default(),
        Some(Value::Bool(allowed)) => ManualRetry {
            allowed: *allowed,
            ..ManualRetry::default()
        },
        Some(Value::Mapping(manual)) => ManualRetry {
            allowed: match manual.get("allowed") {
                None => true,
                Some(_) => bool_field(manual, "allowed", at)?,
            },
            permit_on_passed: bool_field(manual, "permit_on_passed", at)?,
            reason: opt_string(manual, "reason", at)?,
        },
        Some(_) => return Err(malformed(at, "invalid `retry.manual`")),
    };

    Ok(Retry { automatic, manual })
}

fn retry_rule(map: &Mapping, at: &str) -> LoadResult<RetryRule> {
    Ok(RetryRule {
        exit_status: match map.get("exit_status") {
            None | Some(Value::Null) => ExitStatusMatch::Any,
            Some(v) => exit_status(v, at)?,
        },
        signal_reason: opt_string(map, "signal_reason", at)?,
        limit: match map.get("limit") {
            None | Some(Value::Null) => DEFAULT_RETRY_LIMIT,
            Some(v) => int(v)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| malformed(at, "retry limit must be a non-negative integer"))?,
        },
    })
}

fn fields(value: Option<&Value>, at: &str) -> LoadResult<Vec<Field>> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Sequence(items)) => items,
        Some(_) => return Err(malformed(at, "`fields` must be a list")),
    };

    items
        .iter()
        .map(|item| {
            let map = match item {
                Value::Mapping(map) => map,
                _ => return Err(malformed(at, "fields must be mappings")),
            };
            let key = opt_string(map, "key", at)?
                .ok_or_else(|| malformed(at, "field is missing `key`"))?;
            let text = match opt_string(map, "text", at)? {
                Some(text) => text,
                None => opt_string(map, "select", at)?.unwrap_or_else(|| key.clone()),
            };
            let options = match map.get("options") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Sequence(options)) => options
                    .iter()
                    .map(|option| match option {
                        Value::Mapping(option) => {
                            let value = opt_string(option, "value", at)?
                                .ok_or_else(|| malformed(at, "option is missing `value`"))?;
                            Ok(FieldOption {
                                label: opt_string(option, "label", at)?
                                    .unwrap_or_else(|| value.clone()),
                                value,
                            })
                        }
                        other => scalar_string(other)
                            .map(|value| FieldOption {
                                label: value.clone(),
                                value,
                            })
                            .ok_or_else(|| malformed(at, "invalid field option")),
                    })
                    .collect::<LoadResult<_>>()?,
                Some(_) => return Err(malformed(at, "`options` must be a list")),
            };
            Ok(Field {
                key,
                text,
                hint: opt_string(map, "hint", at)?,
                required: match map.get("required") {
                    None => true,
                    Some(_) => bool_field(map, "required", at)?,
                },
                default: string_list(map.get("default"), at, "default")?,
                options,
                multiple: bool_field(map, "multiple", at)?,
            })
        })
        .collect()
}

/// `agents:` as a mapping (`key=value`) or a list of rule strings
fn query_rules(value: Option<&Value>, at: &str) -> LoadResult<Vec<String>> {
    match value {
        Some(Value::Mapping(map)) => {
            let mut rules = Vec::new();
            for (k, v) in map {
                let key = scalar_string(k).ok_or_else(|| malformed(at, "agent rule keys must be strings"))?;
                match v {
                    Value::Sequence(_) => {
                        for value in string_list(Some(v), at, "agents")? {
                            rules.push(format!("{key}={value}"));
                        }
                    }
                    other => rules.push(format!("{key}={}", scalar_string(other).unwrap_or_default())),
                }
            }
            Ok(rules)
        }
        other => string_list(other, at, "agents"),
    }
}

fn string_map(value: Option<&Value>, at: &str) -> LoadResult<BTreeMap<String, String>> {
    match value {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Mapping(map)) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                let key = scalar_string(k).ok_or_else(|| malformed(at, "env keys must be strings"))?;
                let value = match v {
                    Value::Null => String::new(),
                    other => scalar_string(other)
                        .ok_or_else(|| malformed(at, format!("env `{key}` must be a scalar")))?,
                };
                out.insert(key, value);
            }
            Ok(out)
        }
        // `- KEY=value` list form
        Some(Value::Sequence(_)) => {
            let mut out = BTreeMap::new();
            for pair in string_list(value, at, "env")? {
                let (k, v) = pair
                    .split_once('=')
                    .ok_or_else(|| malformed(at, format!("env entry `{pair}` is not KEY=value")))?;
                out.insert(k.to_string(), v.to_string());
            }
            Ok(out)
        }
        Some(_) => Err(malformed(at, "`env` must be a mapping")),
    }
}

fn string_list(value: Option<&Value>, at: &str, field: &str) -> LoadResult<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|item| {
                scalar_string(item)
                    .ok_or_else(|| malformed(at, format!("`{field}` entries must be strings")))
            })
            .collect(),
        Some(other) => scalar_string(other)
            .map(|s| vec![s])
            .ok_or_else(|| malformed(at, format!("`{field}` must be a string or a list"))),
    }
}

fn opt_string(map: &Mapping, key: &str, at: &str) -> LoadResult<Option<String>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => scalar_string(v)
            .map(Some)
            .ok_or_else(|| malformed(at, format!("`{key}` must be a string"))),
    }
}

fn bool_field(map: &Mapping, key: &str, at: &str) -> LoadResult<bool> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) if s == "true" => Ok(true),
        Some(Value::String(s)) if s == "false" => Ok(false),
        Some(_) => Err(malformed(at, format!("`{key}` must be a boolean"))),
    }
}

fn positive_u32(value: Option<&Value>, at: &str, field: &str) -> LoadResult<Option<u32>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => int(v)
            .filter(|n| *n > 0)
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| malformed(at, format!("`{field}` must be a positive integer"))),
    }
}

fn int(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn to_json(value: &Value, at: &str, field: &str) -> LoadResult<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| malformed(at, format!("`{field}` cannot be represented as JSON: {e}")))
}
