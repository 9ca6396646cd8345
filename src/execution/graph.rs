//! Job graph - concurrent store of jobs and their dependency edges

use crate::core::{Job, JobId, JobState};
use crate::execution::planner::{Plan, PlanError};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A terminal transition made by [`JobGraph::complete`] or [`JobGraph::finish`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub state: JobState,
    /// The job was still `waiting`, so the transition started it too
    pub started: bool,
    /// Dependents marked broken as a consequence
    pub broken: Vec<JobId>,
}

#[derive(Debug, Default)]
struct GraphInner {
    jobs: HashMap<JobId, Job>,
    /// `dependencies[x]`: ids `x` depends on
    dependencies: HashMap<JobId, Vec<JobId>>,
    /// `dependents[x]`: ids that depend on `x`
    dependents: HashMap<JobId, Vec<JobId>>,
    /// Insertion order; uploads append
    ordered_ids: Vec<JobId>,
}

impl GraphInner {
    fn add_job(&mut self, job: Job) {
        let id = job.id.clone();
        self.dependencies.entry(id.clone()).or_default();
        self.dependents.entry(id.clone()).or_default();
        self.ordered_ids.push(id.clone());
        self.jobs.insert(id, job);
    }

    fn add_dependency(&mut self, dependent: &JobId, dependency: &JobId) -> Result<(), PlanError> {
        for id in [dependent, dependency] {
            if !self.jobs.contains_key(id) {
                return Err(PlanError::UnknownJob(id.clone()));
            }
        }
        let deps = self.dependencies.entry(dependent.clone()).or_default();
        if !deps.contains(dependency) {
            deps.push(dependency.clone());
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .push(dependent.clone());
        }
        Ok(())
    }

    fn remove_dependency(&mut self, dependent: &JobId, dependency: &JobId) {
        if let Some(deps) = self.dependencies.get_mut(dependent) {
            deps.retain(|d| d != dependency);
        }
        if let Some(deps) = self.dependents.get_mut(dependency) {
            deps.retain(|d| d != dependent);
        }
    }

    /// Apply a transition. Terminal states are absorbing; timestamps are set once.
    fn set_state(&mut self, id: &JobId, state: JobState) -> Result<bool, PlanError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| PlanError::UnknownJob(id.clone()))?;
        if job.state.is_terminal() || job.state == state {
            return Ok(false);
        }

        let now = Utc::now();
        if state == JobState::Running && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if state.is_terminal() && job.ended_at.is_none() {
            job.ended_at = Some(now);
        }
        debug!(job = %id, from = %job.state, to = %state, "job transition");
        job.state = state;
        Ok(true)
    }

    fn is_ready(&self, job: &Job) -> bool {
        if job.state != JobState::Pending {
            return false;
        }
        self.dependencies
            .get(&job.id)
            .into_iter()
            .flatten()
            .filter_map(|dep| self.jobs.get(dep))
            .all(|dep| {
                dep.state.is_terminal()
                    && (dep.state.satisfies_dependents() || job.tolerates_failure_of(dep))
            })
    }

    /// Whether `job` can never run because a dependency it does not tolerate went bad
    fn is_stranded(&self, job: &Job) -> bool {
        !job.state.is_terminal()
            && self
                .dependencies
                .get(&job.id)
                .into_iter()
                .flatten()
                .filter_map(|dep| self.jobs.get(dep))
                .any(|dep| dep.state.breaks_dependents() && !job.tolerates_failure_of(dep))
    }

    /// Move `id` to a terminal state and cascade. `None` when the job was
    /// already terminal.
    fn complete(
        &mut self,
        id: &JobId,
        state: JobState,
        exit_code: Option<i32>,
    ) -> Result<Option<Completion>, PlanError> {
        if !self.set_state(id, state)? {
            return Ok(None);
        }
        if let Some(job) = self.jobs.get_mut(id) {
            job.exit_code = exit_code;
        }

        let broken = if state.breaks_dependents() {
            self.cascade(vec![id.clone()])
        } else {
            Vec::new()
        };
        if !broken.is_empty() {
            info!(job = %id, broken = broken.len(), "dependency failure cascaded");
        }
        Ok(Some(Completion {
            state,
            started: false,
            broken,
        }))
    }

    /// Every job that depends on `id`, directly or transitively
    fn descendants(&self, id: &JobId) -> HashSet<JobId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&JobId> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents.get(current).into_iter().flatten() {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        seen
    }

    fn name_of(&self, id: &JobId) -> String {
        self.jobs
            .get(id)
            .map(|j| j.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Mark every stranded job reachable from `start` as broken, transitively
    fn cascade(&mut self, start: Vec<JobId>) -> Vec<JobId> {
        let mut broken = Vec::new();
        let mut queue: VecDeque<JobId> = start.into();
        let mut seen = HashSet::new();

        while let Some(id) = queue.pop_front() {
            let dependents = self.dependents.get(&id).cloned().unwrap_or_default();
            for dependent in dependents {
                if !seen.insert(dependent.clone()) {
                    continue;
                }
                let stranded = self
                    .jobs
                    .get(&dependent)
                    .is_some_and(|job| self.is_stranded(job));
                if stranded && matches!(self.set_state(&dependent, JobState::Broken), Ok(true)) {
                    broken.push(dependent.clone());
                    queue.push_back(dependent);
                } else {
                    seen.remove(&dependent);
                }
            }
        }
        broken
    }
}

/// Concurrent job graph: exclusive mutation, shared reads.
///
/// Every method takes the lock once, so state and adjacency are always
/// observed together.
#[derive(Debug, Default)]
pub struct JobGraph {
    inner: RwLock<GraphInner>,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from an initial plan
    pub fn from_plan(plan: Plan) -> Result<Self, PlanError> {
        let mut inner = GraphInner::default();
        for job in plan.jobs {
            inner.add_job(job);
        }
        for (dependent, dependency) in &plan.edges {
            inner.add_dependency(dependent, dependency)?;
        }
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    pub async fn add_job(&self, job: Job) {
        self.inner.write().await.add_job(job);
    }

    pub async fn add_dependency(&self, dependent: &JobId, dependency: &JobId) -> Result<(), PlanError> {
        self.inner.write().await.add_dependency(dependent, dependency)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.jobs.is_empty()
    }

    pub async fn get(&self, id: &JobId) -> Option<Job> {
        self.inner.read().await.jobs.get(id).cloned()
    }

    /// All jobs in insertion order
    pub async fn snapshot(&self) -> Vec<Job> {
        let inner = self.inner.read().await;
        inner
            .ordered_ids
            .iter()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect()
    }

    /// Pending jobs whose dependencies are all terminal and, unless the job
    /// tolerates failure, all satisfied. Insertion order.
    pub async fn get_ready(&self) -> Vec<Job> {
        let inner = self.inner.read().await;
        inner
            .ordered_ids
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| inner.is_ready(job))
            .cloned()
            .collect()
    }

    pub async fn get_dependencies(&self, id: &JobId) -> Vec<JobId> {
        self.inner
            .read()
            .await
            .dependencies
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_dependents(&self, id: &JobId) -> Vec<JobId> {
        self.inner
            .read()
            .await
            .dependents
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Transition a job. Returns `false` when the job was already terminal or
    /// already in `state`.
    pub async fn update_state(&self, id: &JobId, state: JobState) -> Result<bool, PlanError> {
        self.inner.write().await.set_state(id, state)
    }

    /// Transition only if the job is currently in `expected`
    pub async fn update_state_if(
        &self,
        id: &JobId,
        expected: JobState,
        state: JobState,
    ) -> Result<bool, PlanError> {
        let mut inner = self.inner.write().await;
        match inner.jobs.get(id) {
            Some(job) if job.state == expected => inner.set_state(id, state),
            Some(_) => Ok(false),
            None => Err(PlanError::UnknownJob(id.clone())),
        }
    }

    /// Move a job to a terminal state and break the dependents that cannot run
    /// anymore, in one step. `None` when the job was already terminal.
    pub async fn complete(
        &self,
        id: &JobId,
        state: JobState,
        exit_code: Option<i32>,
    ) -> Result<Option<Completion>, PlanError> {
        self.inner.write().await.complete(id, state, exit_code)
    }

    /// Record an agent-reported exit. The terminal state follows the job's
    /// soft-fail policy; a job finished before it was started is started first.
    pub async fn finish(&self, id: &JobId, exit_code: i32) -> Result<Option<Completion>, PlanError> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get(id)
            .ok_or_else(|| PlanError::UnknownJob(id.clone()))?;
        if job.state.is_terminal() {
            return Ok(None);
        }
        let state = job.state_for_exit(exit_code);
        let waiting = job.state == JobState::Waiting;

        let started = waiting && inner.set_state(id, JobState::Running)?;
        let completion = inner.complete(id, state, Some(exit_code))?;
        Ok(completion.map(|done| Completion { started, ..done }))
    }

    pub async fn all_terminal(&self) -> bool {
        self.inner
            .read()
            .await
            .jobs
            .values()
            .all(|j| j.state.is_terminal())
    }

    /// Number of jobs per state; every state is present
    pub async fn counts(&self) -> BTreeMap<JobState, usize> {
        let inner = self.inner.read().await;
        let mut counts: BTreeMap<JobState, usize> =
            JobState::ALL.iter().map(|s| (*s, 0)).collect();
        for job in inner.jobs.values() {
            *counts.entry(job.state).or_default() += 1;
        }
        counts
    }

    /// Splice an uploaded plan into the graph.
    ///
    /// The plan's roots come to depend on `anchor`, and every job that
    /// depended on `anchor` now depends on the plan's sinks instead, so the
    /// new jobs sit between the anchor and its former dependents. Without an
    /// anchor the jobs are appended as they are.
    pub async fn insert_jobs_after(
        &self,
        anchor: Option<&JobId>,
        plan: Plan,
    ) -> Result<Vec<JobId>, PlanError> {
        let mut inner = self.inner.write().await;

        if let Some(anchor) = anchor {
            if !inner.jobs.contains_key(anchor) {
                return Err(PlanError::UnknownJob(anchor.clone()));
            }
        }
        let new_ids: HashSet<&JobId> = plan.jobs.iter().map(|j| &j.id).collect();
        for (_, dependency) in &plan.edges {
            if !new_ids.contains(dependency) && !inner.jobs.contains_key(dependency) {
                return Err(PlanError::UnknownJob(dependency.clone()));
            }
        }

        // Former dependents of the anchor will wait on the new jobs, so a new
        // job must not wait on any of them.
        if let Some(anchor) = anchor {
            let downstream = inner.descendants(anchor);
            let names: HashMap<&JobId, &str> =
                plan.jobs.iter().map(|j| (&j.id, j.name.as_str())).collect();
            if let Some((dependent, dependency)) = plan
                .edges
                .iter()
                .find(|(_, dependency)| downstream.contains(dependency))
            {
                return Err(PlanError::UploadCycle {
                    job: names.get(dependent).map(|n| n.to_string()).unwrap_or_default(),
                    dependency: inner.name_of(dependency),
                    anchor: inner.name_of(anchor),
                });
            }
        }

        let roots = plan.roots();
        let sinks = plan.sinks();
        let inserted: Vec<JobId> = plan.jobs.iter().map(|j| j.id.clone()).collect();

        for job in plan.jobs {
            inner.add_job(job);
        }
        for (dependent, dependency) in &plan.edges {
            inner.add_dependency(dependent, dependency)?;
        }

        if let Some(anchor) = anchor {
            let former = inner.dependents.get(anchor).cloned().unwrap_or_default();
            for dependent in former.iter().filter(|d| !inserted.contains(*d)) {
                inner.remove_dependency(dependent, anchor);
                for sink in &sinks {
                    inner.add_dependency(dependent, sink)?;
                }
            }
            for root in &roots {
                inner.add_dependency(root, anchor)?;
            }
        }

        // New jobs may depend on keys that already failed
        let stranded: Vec<JobId> = inserted
            .iter()
            .filter(|id| inner.jobs.get(*id).is_some_and(|job| inner.is_stranded(job)))
            .cloned()
            .collect();
        for id in &stranded {
            inner.set_state(id, JobState::Broken)?;
        }
        inner.cascade(stranded);

        info!(
            anchor = anchor.map(JobId::as_str).unwrap_or("-"),
            jobs = inserted.len(),
            "spliced uploaded pipeline"
        );
        Ok(inserted)
    }

    /// Cancel every job the agent has not started. Running jobs are left to
    /// report their own exit.
    pub async fn cancel_unstarted(&self) -> Vec<JobId> {
        self.cancel_where(|state| matches!(state, JobState::Pending | JobState::Waiting))
            .await
    }

    /// Cancel every non-terminal job
    pub async fn cancel_remaining(&self) -> Vec<JobId> {
        self.cancel_where(|state| !state.is_terminal()).await
    }

    async fn cancel_where(&self, select: impl Fn(JobState) -> bool) -> Vec<JobId> {
        let mut inner = self.inner.write().await;
        let selected: Vec<JobId> = inner
            .ordered_ids
            .iter()
            .filter(|id| inner.jobs.get(*id).is_some_and(|j| select(j.state)))
            .cloned()
            .collect();
        for id in &selected {
            let _ = inner.set_state(id, JobState::Canceled);
        }
        selected
    }

    /// Every `(dependent, dependency)` edge, dependents in insertion order
    pub async fn edges(&self) -> Vec<(JobId, JobId)> {
        let inner = self.inner.read().await;
        inner
            .ordered_ids
            .iter()
            .flat_map(|id| {
                inner
                    .dependencies
                    .get(id)
                    .into_iter()
                    .flatten()
                    .map(move |dep| (id.clone(), dep.clone()))
            })
            .collect()
    }
}
