//! Planner - expands pipeline steps into jobs and wires their dependencies

use crate::core::{
    Dependency, Job, JobId, Matrix, Pipeline, SoftFail, Step, StepKind, TriggerTarget,
    LINEAR_AXIS,
};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;

/// Errors raised while planning
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("step `{step}` depends on `{key}`, which matches no earlier step")]
    DependencyKeyUnresolved { step: String, key: String },

    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    #[error("uploaded job `{job}` depends on `{dependency}`, which already runs after `{anchor}`")]
    UploadCycle {
        job: String,
        dependency: String,
        anchor: String,
    },
}

/// Planner output: jobs in source order and `(dependent, dependency)` edges.
///
/// Edges may point at jobs outside the plan when a dynamically uploaded
/// pipeline depends on keys already present in the running graph.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub jobs: Vec<Job>,
    pub edges: Vec<(JobId, JobId)>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn ids(&self) -> HashSet<&JobId> {
        self.jobs.iter().map(|j| &j.id).collect()
    }

    /// Jobs with no dependency inside the plan
    pub fn roots(&self) -> Vec<JobId> {
        let ids = self.ids();
        let dependent: HashSet<&JobId> = self
            .edges
            .iter()
            .filter(|(_, dep)| ids.contains(dep))
            .map(|(job, _)| job)
            .collect();
        self.jobs
            .iter()
            .filter(|j| !dependent.contains(&j.id))
            .map(|j| j.id.clone())
            .collect()
    }

    /// Jobs nothing else in the plan depends on
    pub fn sinks(&self) -> Vec<JobId> {
        let depended_on: HashSet<&JobId> = self.edges.iter().map(|(_, dep)| dep).collect();
        self.jobs
            .iter()
            .filter(|j| !depended_on.contains(&j.id))
            .map(|j| j.id.clone())
            .collect()
    }

    /// Dependencies of `id` recorded in this plan
    pub fn dependencies_of(&self, id: &JobId) -> Vec<JobId> {
        self.edges
            .iter()
            .filter(|(job, _)| job == id)
            .map(|(_, dep)| dep.clone())
            .collect()
    }

    /// Largest number of non-wait jobs sharing a topological layer.
    ///
    /// A job's layer is the length of its longest dependency chain inside
    /// the plan. Used as the worker-count hint when none is configured.
    pub fn max_concurrency(&self) -> usize {
        let mut deps: HashMap<&JobId, Vec<&JobId>> = HashMap::new();
        for (job, dep) in &self.edges {
            deps.entry(job).or_default().push(dep);
        }

        // Jobs are in source order and only ever depend on earlier jobs
        let mut layer: HashMap<&JobId, usize> = HashMap::new();
        let mut widths: BTreeMap<usize, usize> = BTreeMap::new();
        for job in &self.jobs {
            let depth = deps
                .get(&job.id)
                .into_iter()
                .flatten()
                .filter_map(|dep| layer.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            layer.insert(&job.id, depth);
            if job.kind != StepKind::Wait {
                *widths.entry(depth).or_default() += 1;
            }
        }

        widths.values().copied().max().unwrap_or(0)
    }
}

/// Enclosing group of the steps being planned
#[derive(Debug, Clone, Default)]
struct GroupScope {
    key: Option<String>,
    label: Option<String>,
    depends_on: Vec<Dependency>,
    allow_dependency_failure: bool,
}

/// One matrix combination after adjustments
#[derive(Debug, Clone, Default, PartialEq)]
struct Combination {
    values: BTreeMap<String, String>,
    soft_fail: Option<SoftFail>,
    env: BTreeMap<String, String>,
}

/// Expands pipelines into jobs
#[derive(Debug, Clone, Default)]
pub struct Planner {
    /// Lowest-precedence environment, overlaid by pipeline and step env
    ambient_env: BTreeMap<String, String>,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ambient_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.ambient_env = env;
        self
    }

    /// Plan a pipeline from scratch
    pub fn plan(&self, pipeline: &Pipeline) -> Result<Plan, PlanError> {
        self.plan_with_existing(pipeline, &[])
    }

    /// Plan a pipeline whose `depends_on` keys may also resolve to `existing` jobs
    pub fn plan_with_existing(
        &self,
        pipeline: &Pipeline,
        existing: &[Job],
    ) -> Result<Plan, PlanError> {
        let mut builder = PlanBuilder::new(self, pipeline);
        for job in existing {
            builder.index(job);
        }
        builder.plan_steps(&pipeline.steps, None)?;

        let plan = Plan {
            jobs: builder.jobs,
            edges: builder.edges,
        };
        debug!(jobs = plan.len(), edges = plan.edges.len(), "planned pipeline");
        Ok(plan)
    }
}

struct PlanBuilder<'a> {
    planner: &'a Planner,
    pipeline: &'a Pipeline,
    jobs: Vec<Job>,
    edges: Vec<(JobId, JobId)>,
    keys: HashMap<String, Vec<JobId>>,
    last_barrier: Vec<JobId>,
    current_group: Vec<JobId>,
}

impl<'a> PlanBuilder<'a> {
    fn new(planner: &'a Planner, pipeline: &'a Pipeline) -> Self {
        Self {
            planner,
            pipeline,
            jobs: Vec::new(),
            edges: Vec::new(),
            keys: HashMap::new(),
            last_barrier: Vec::new(),
            current_group: Vec::new(),
        }
    }

    fn index(&mut self, job: &Job) {
        for key in [&job.key, &job.group_key].into_iter().flatten() {
            self.keys.entry(key.clone()).or_default().push(job.id.clone());
        }
    }

    fn plan_steps(&mut self, steps: &[Step], group: Option<&GroupScope>) -> Result<(), PlanError> {
        for step in steps {
            match step.kind {
                StepKind::Wait => self.plan_wait(step, group)?,
                StepKind::Group => {
                    let scope = GroupScope {
                        key: step.key.clone(),
                        label: step.group.clone().or_else(|| step.label.clone()),
                        depends_on: step.depends_on.clone(),
                        allow_dependency_failure: step.allow_dependency_failure,
                    };
                    self.plan_steps(&step.steps, Some(&scope))?;
                }
                StepKind::Command => {
                    let deps = self.resolve(step, group)?;
                    for job in self.expand_command(step, group) {
                        self.push(job, &deps);
                    }
                }
                StepKind::Block | StepKind::Input | StepKind::Trigger => {
                    let deps = self.resolve(step, group)?;
                    let job = self.single_job(step, group);
                    self.push(job, &deps);
                }
            }
        }
        Ok(())
    }

    fn plan_wait(&mut self, step: &Step, group: Option<&GroupScope>) -> Result<(), PlanError> {
        let mut job = self.base_job(step, group);
        job.allow_dep_fail = step.continue_on_failure;

        // Two waits in a row: the second one orders after the first
        let mut deps = if self.current_group.is_empty() {
            self.last_barrier.clone()
        } else {
            std::mem::take(&mut self.current_group)
        };
        if !step.depends_on.is_empty() {
            for dep in self.resolve_keys(step, &step.depends_on)? {
                if !deps.contains(&dep) {
                    deps.push(dep);
                }
            }
        }

        let id = job.id.clone();
        for dep in deps {
            self.edges.push((id.clone(), dep));
        }
        self.index(&job);
        self.jobs.push(job);
        self.last_barrier = vec![id];
        self.current_group.clear();
        Ok(())
    }

    /// Dependencies for jobs of `step`, resolved before any of them is indexed
    fn resolve(&self, step: &Step, group: Option<&GroupScope>) -> Result<Vec<JobId>, PlanError> {
        let explicit = Self::dependencies(step, group);
        if explicit.is_empty() {
            Ok(self.last_barrier.clone())
        } else {
            self.resolve_keys(step, explicit)
        }
    }

    fn resolve_keys(&self, step: &Step, deps: &[Dependency]) -> Result<Vec<JobId>, PlanError> {
        let mut resolved = Vec::new();
        for dep in deps {
            let ids = self.keys.get(&dep.key).filter(|ids| !ids.is_empty()).ok_or_else(|| {
                PlanError::DependencyKeyUnresolved {
                    step: step.key.clone().unwrap_or_else(|| step.display_name()),
                    key: dep.key.clone(),
                }
            })?;
            for id in ids {
                if !resolved.contains(id) {
                    resolved.push(id.clone());
                }
            }
        }
        Ok(resolved)
    }

    /// The step's own `depends_on`, or its group's when it declares none
    fn dependencies<'s>(step: &'s Step, group: Option<&'s GroupScope>) -> &'s [Dependency] {
        match group {
            Some(scope) if step.depends_on.is_empty() => &scope.depends_on,
            _ => &step.depends_on,
        }
    }

    fn push(&mut self, job: Job, deps: &[JobId]) {
        for dep in deps {
            self.edges.push((job.id.clone(), dep.clone()));
        }
        self.current_group.push(job.id.clone());
        self.index(&job);
        self.jobs.push(job);
    }

    fn base_job(&self, step: &Step, group: Option<&GroupScope>) -> Job {
        let mut job = Job::new(step.kind, step.display_name());
        job.key = step.key.clone();
        if let Some(scope) = group {
            job.group_key = scope.key.clone();
            job.group = scope.label.clone();
        }

        let deps = Self::dependencies(step, group);
        job.depends_on = deps.iter().map(|d| d.key.clone()).collect();
        job.allow_dep_fail = step.allow_dependency_failure
            || group.is_some_and(|g| g.allow_dependency_failure)
            || (!deps.is_empty() && deps.iter().all(|d| d.allow_failure));
        job.allow_failure_keys = deps
            .iter()
            .filter(|d| d.allow_failure)
            .map(|d| d.key.clone())
            .collect();
        job
    }

    fn single_job(&self, step: &Step, group: Option<&GroupScope>) -> Job {
        let mut job = self.base_job(step, group);
        job.env = self.merged_env(step);
        if let Some(pipeline) = &step.trigger {
            job.trigger = Some(TriggerTarget {
                pipeline: pipeline.clone(),
                build: step.build.clone(),
                is_async: step.is_async,
            });
        }
        job
    }

    fn expand_command(&self, step: &Step, group: Option<&GroupScope>) -> Vec<Job> {
        let combinations = match &step.matrix {
            Some(matrix) => combinations(matrix),
            None => vec![Combination::default()],
        };
        let linear = step.matrix.as_ref().is_some_and(Matrix::is_linear);
        let shards = step.parallelism.unwrap_or(1);
        let base_env = self.merged_env(step);

        let mut jobs = Vec::new();
        for combination in &combinations {
            let mut env = base_env.clone();
            expand_into(&mut env, &combination.env);
            for (axis, value) in &combination.values {
                env.insert(matrix_env_name(axis), value.clone());
            }

            for shard in 0..shards {
                let mut job = self.base_job(step, group);
                job.name = interpolate_matrix(&job.name, &combination.values, linear);
                job.commands = step
                    .command_lines()
                    .iter()
                    .map(|line| interpolate_matrix(line, &combination.values, linear))
                    .collect();
                job.plugins = step.plugins.clone();
                job.agent_query_rules = if step.agent_query_rules.is_empty() {
                    self.pipeline.agent_query_rules.clone()
                } else {
                    step.agent_query_rules.clone()
                };
                job.artifact_paths = step.artifact_paths.clone();
                job.timeout_minutes = step.timeout_minutes;
                job.soft_fail = combination
                    .soft_fail
                    .clone()
                    .unwrap_or_else(|| step.soft_fail.clone());
                job.retry_policy = step.retry.clone();
                job.matrix_values = combination.values.clone();

                // `concurrency` without a group has nothing to count against
                if let Some(group_name) = &step.concurrency_group {
                    job.concurrency_group = Some(group_name.clone());
                    job.concurrency_limit = Some(step.concurrency.unwrap_or(1));
                }

                job.env = env.clone();
                if step.parallelism.is_some() {
                    job.parallel_index = shard;
                    job.parallel_total = shards;
                    job.env
                        .insert("BUILDKITE_PARALLEL_JOB".to_string(), shard.to_string());
                    job.env
                        .insert("BUILDKITE_PARALLEL_JOB_COUNT".to_string(), shards.to_string());
                }
                jobs.push(job);
            }
        }
        jobs
    }

    /// ambient <- pipeline <- step, with step values expanded against what came before
    fn merged_env(&self, step: &Step) -> BTreeMap<String, String> {
        let mut env = self.planner.ambient_env.clone();
        env.extend(self.pipeline.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        expand_into(&mut env, &step.env);
        env
    }
}

/// Cartesian product over sorted axes, with adjustments applied
fn combinations(matrix: &Matrix) -> Vec<Combination> {
    let mut product = vec![BTreeMap::new()];
    for (axis, values) in matrix.axes() {
        product = product
            .into_iter()
            .flat_map(|partial: BTreeMap<String, String>| {
                let axis = axis.clone();
                values.iter().map(move |value| {
                    let mut next = partial.clone();
                    next.insert(axis.clone(), value.clone());
                    next
                })
            })
            .collect();
    }

    let mut out: Vec<Combination> = product
        .into_iter()
        .map(|values| Combination {
            values,
            ..Combination::default()
        })
        .collect();

    for adjustment in &matrix.adjustments {
        if adjustment.skip {
            out.retain(|c| c.values != adjustment.with);
            continue;
        }
        match out.iter_mut().find(|c| c.values == adjustment.with) {
            Some(existing) => {
                if adjustment.soft_fail.is_some() {
                    existing.soft_fail = adjustment.soft_fail.clone();
                }
                existing.env.extend(adjustment.env.clone());
            }
            None => out.push(Combination {
                values: adjustment.with.clone(),
                soft_fail: adjustment.soft_fail.clone(),
                env: adjustment.env.clone(),
            }),
        }
    }
    out
}

/// `BUILDKITE_MATRIX_<AXIS>` with the axis upper-cased
fn matrix_env_name(axis: &str) -> String {
    let axis: String = axis
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("BUILDKITE_MATRIX_{axis}")
}

static MATRIX_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*matrix(?:\.([A-Za-z0-9_-]+))?\s*\}\}").expect("constant regex pattern is valid")
});

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("constant regex pattern is valid")
});

/// Replace `{{matrix.axis}}`, and `{{matrix}}` for single-axis matrices
fn interpolate_matrix(text: &str, values: &BTreeMap<String, String>, linear: bool) -> String {
    if values.is_empty() {
        return text.to_string();
    }
    MATRIX_PATTERN
        .replace_all(text, |caps: &Captures| {
            let value = match caps.get(1) {
                Some(axis) => values.get(axis.as_str()),
                None if linear => values.get(LINEAR_AXIS),
                None => None,
            };
            value.cloned().unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Expand `$VAR` and `${VAR}` against `env`; unknown names and `$$` stay as written
pub fn expand_vars(text: &str, env: &BTreeMap<String, String>) -> String {
    ENV_VAR_PATTERN
        .replace_all(text, |caps: &Captures| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .and_then(|name| env.get(name.as_str()))
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Layer `overlay` onto `env`, expanding each value against the accumulated env
fn expand_into(env: &mut BTreeMap<String, String>, overlay: &BTreeMap<String, String>) {
    for (key, value) in overlay {
        let expanded = expand_vars(value, env);
        env.insert(key.clone(), expanded);
    }
}
