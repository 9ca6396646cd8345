//! Scheduler - admits ready jobs for handout and applies agent-reported updates

use crate::core::{Job, JobId, JobState, Pipeline, StepKind};
use crate::execution::graph::JobGraph;
use crate::execution::planner::{PlanError, Planner};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default tick period of the admission loop
pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

const EVENT_CAPACITY: usize = 1024;

/// Events broadcast by the scheduler
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    JobStarted {
        id: JobId,
    },
    JobFinished {
        id: JobId,
        state: JobState,
        exit_code: Option<i32>,
    },
    PipelineUpload {
        /// Job that uploaded, if the upload was job-scoped
        id: Option<JobId>,
        pipeline: Pipeline,
        inserted: Vec<JobId>,
    },
}

/// A sample of scheduler progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub counts: BTreeMap<JobState, usize>,
    /// Jobs admitted for handout and not yet finished
    pub live: usize,
}

impl SchedulerStats {
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn count(&self, state: JobState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    pub fn finished(&self) -> usize {
        self.counts
            .iter()
            .filter(|(state, _)| state.is_terminal())
            .map(|(_, n)| n)
            .sum()
    }
}

/// Worker and concurrency-group accounting; changed only under its lock
#[derive(Debug, Default)]
struct Counters {
    live: usize,
    groups: HashMap<String, usize>,
    limits: HashMap<String, u32>,
    /// Admitted jobs and the group they count against
    admitted: HashMap<JobId, Option<String>>,
}

/// Owns admission: which jobs the server may hand out, and when
pub struct Scheduler {
    graph: Arc<JobGraph>,
    planner: Planner,
    workers: usize,
    tick: Duration,
    ready_tx: StdMutex<Option<mpsc::Sender<JobId>>>,
    ready_rx: Mutex<mpsc::Receiver<JobId>>,
    events: StdMutex<Option<broadcast::Sender<SchedulerEvent>>>,
    counters: StdMutex<Counters>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(graph: Arc<JobGraph>, workers: usize, cancel: CancellationToken) -> Self {
        let workers = workers.max(1);
        let (ready_tx, ready_rx) = mpsc::channel(workers);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            graph,
            planner: Planner::new(),
            workers,
            tick: DEFAULT_TICK,
            ready_tx: StdMutex::new(Some(ready_tx)),
            ready_rx: Mutex::new(ready_rx),
            events: StdMutex::new(Some(events)),
            counters: StdMutex::new(Counters::default()),
            cancel,
        }
    }

    /// Planner used for uploaded pipelines
    pub fn with_planner(mut self, planner: Planner) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn graph(&self) -> &Arc<JobGraph> {
        &self.graph
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Subscribe to scheduler events. Once the scheduler has terminated the
    /// returned receiver is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        match self.events.lock() {
            Ok(events) => match events.as_ref() {
                Some(tx) => tx.subscribe(),
                None => broadcast::channel(1).1,
            },
            Err(_) => broadcast::channel(1).1,
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Ok(events) = self.events.lock() {
            if let Some(tx) = events.as_ref() {
                // No subscribers is fine
                let _ = tx.send(event);
            }
        }
    }

    /// Drop the queue and events senders
    fn close(&self) {
        if let Ok(mut tx) = self.ready_tx.lock() {
            tx.take();
        }
        if let Ok(mut events) = self.events.lock() {
            events.take();
        }
    }

    /// Run the admission loop until the graph is all-terminal or the run is canceled
    pub async fn run(self: Arc<Self>) {
        info!(workers = self.workers, "scheduler started");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("scheduler canceled");
                    break;
                }
                _ = interval.tick() => {}
            }

            if self.graph.all_terminal().await {
                info!("all jobs finished");
                break;
            }
            self.tick_once().await;
        }

        self.close();
    }

    /// One admission pass. Jobs resolved locally (waits, blocks, triggers) can
    /// unblock more jobs, so the pass repeats until it stops making progress.
    pub async fn tick_once(&self) {
        loop {
            let mut resolved = false;
            for job in self.graph.get_ready().await {
                match job.kind {
                    StepKind::Command => self.admit(&job).await,
                    StepKind::Wait | StepKind::Block | StepKind::Input | StepKind::Group => {
                        resolved |= self.resolve_locally(&job, JobState::Passed).await;
                    }
                    StepKind::Trigger => {
                        resolved |= self.resolve_locally(&job, JobState::Skipped).await;
                    }
                }
            }
            if !resolved {
                break;
            }
        }
    }

    async fn resolve_locally(&self, job: &Job, state: JobState) -> bool {
        match self.graph.complete(&job.id, state, None).await {
            Ok(Some(done)) => {
                debug!(job = %job.id, kind = %job.kind, %state, "resolved without the agent");
                self.emit(SchedulerEvent::JobFinished {
                    id: job.id.clone(),
                    state: done.state,
                    exit_code: None,
                });
                self.emit_broken(done.broken);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(job = %job.id, error = %e, "failed to resolve job");
                false
            }
        }
    }

    /// Reserve capacity for `job` and enqueue it
    async fn admit(&self, job: &Job) {
        if !self.reserve(job) {
            return;
        }

        match self
            .graph
            .update_state_if(&job.id, JobState::Pending, JobState::Waiting)
            .await
        {
            Ok(true) => {}
            _ => {
                self.release(&job.id);
                return;
            }
        }

        let sent = match self.ready_tx.lock() {
            Ok(tx) => tx
                .as_ref()
                .map(|tx| tx.try_send(job.id.clone()).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        };
        if sent {
            debug!(job = %job.id, name = %job.name, "job queued");
        } else {
            warn!(job = %job.id, "ready queue unavailable, job returned to pending");
            let _ = self
                .graph
                .update_state_if(&job.id, JobState::Waiting, JobState::Pending)
                .await;
            self.release(&job.id);
        }
    }

    /// Take a worker slot and a group slot, or neither
    fn reserve(&self, job: &Job) -> bool {
        let Ok(mut counters) = self.counters.lock() else {
            return false;
        };
        if counters.admitted.contains_key(&job.id) || counters.live >= self.workers {
            return false;
        }

        if let Some(group) = &job.concurrency_group {
            let configured = job.concurrency_limit.unwrap_or(1);
            let limit = *counters
                .limits
                .entry(group.clone())
                .and_modify(|l| *l = (*l).min(configured))
                .or_insert(configured);
            let in_group = counters.groups.get(group).copied().unwrap_or(0);
            if in_group >= limit as usize {
                return false;
            }
            *counters.groups.entry(group.clone()).or_default() += 1;
        }

        counters.live += 1;
        counters
            .admitted
            .insert(job.id.clone(), job.concurrency_group.clone());
        true
    }

    fn release(&self, id: &JobId) {
        let Ok(mut counters) = self.counters.lock() else {
            return;
        };
        if let Some(group) = counters.admitted.remove(id) {
            counters.live = counters.live.saturating_sub(1);
            if let Some(group) = group {
                if let Some(n) = counters.groups.get_mut(&group) {
                    *n = n.saturating_sub(1);
                }
            }
        }
    }

    fn emit_broken(&self, broken: Vec<JobId>) {
        for id in broken {
            self.release(&id);
            self.emit(SchedulerEvent::JobFinished {
                id,
                state: JobState::Broken,
                exit_code: None,
            });
        }
    }

    /// Pop one queued job without waiting. Jobs that left `waiting` while
    /// queued (canceled runs) are dropped.
    pub async fn next_job(&self) -> Option<Job> {
        let mut rx = self.ready_rx.try_lock().ok()?;
        while let Ok(id) = rx.try_recv() {
            match self.graph.get(&id).await {
                Some(job) if job.state == JobState::Waiting => return Some(job),
                _ => self.release(&id),
            }
        }
        None
    }

    /// The agent started the job
    pub async fn handle_assigned(&self, id: &JobId) -> Result<(), PlanError> {
        if self
            .graph
            .update_state_if(id, JobState::Waiting, JobState::Running)
            .await?
        {
            info!(job = %id, "job started");
            self.emit(SchedulerEvent::JobStarted { id: id.clone() });
        }
        Ok(())
    }

    /// The agent finished the job with `exit_code`. Repeated reports for a
    /// job are answered with its state and emit nothing.
    pub async fn handle_finished(&self, id: &JobId, exit_code: i32) -> Result<JobState, PlanError> {
        let finished = self.graph.finish(id, exit_code).await?;
        self.release(id);

        let Some(done) = finished else {
            let state = self
                .graph
                .get(id)
                .await
                .map(|j| j.state)
                .ok_or_else(|| PlanError::UnknownJob(id.clone()))?;
            debug!(job = %id, %state, "finish for a job already terminal");
            return Ok(state);
        };

        // Finish without start: keep JobStarted ahead of JobFinished
        if done.started {
            info!(job = %id, "job started");
            self.emit(SchedulerEvent::JobStarted { id: id.clone() });
        }
        info!(job = %id, exit_code, state = %done.state, "job finished");
        self.emit(SchedulerEvent::JobFinished {
            id: id.clone(),
            state: done.state,
            exit_code: Some(exit_code),
        });
        self.emit_broken(done.broken);
        Ok(done.state)
    }

    /// Fail a job the agent never picked up or lost track of
    pub async fn handle_abandoned(&self, id: &JobId, state: JobState) -> Result<(), PlanError> {
        let abandoned = self.graph.complete(id, state, None).await?;
        self.release(id);
        if let Some(done) = abandoned {
            warn!(job = %id, %state, "job abandoned");
            self.emit(SchedulerEvent::JobFinished {
                id: id.clone(),
                state: done.state,
                exit_code: None,
            });
            self.emit_broken(done.broken);
        }
        Ok(())
    }

    /// Plan an uploaded pipeline and splice it in after `anchor`
    pub async fn handle_upload(
        &self,
        anchor: Option<&JobId>,
        pipeline: Pipeline,
    ) -> Result<Vec<JobId>, PlanError> {
        let existing = self.graph.snapshot().await;
        let plan = self.planner.plan_with_existing(&pipeline, &existing)?;
        let inserted = self.graph.insert_jobs_after(anchor, plan).await?;

        info!(jobs = inserted.len(), "pipeline uploaded");
        self.emit(SchedulerEvent::PipelineUpload {
            id: anchor.cloned(),
            pipeline,
            inserted: inserted.clone(),
        });
        Ok(inserted)
    }

    /// Per-state counts plus the live count
    pub async fn stats(&self) -> SchedulerStats {
        let counts = self.graph.counts().await;
        let live = self.counters.lock().map(|c| c.live).unwrap_or(0);
        SchedulerStats { counts, live }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
