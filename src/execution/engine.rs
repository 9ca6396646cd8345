//! Orchestrator - drives a whole local run from pipeline file to summary

use crate::{
    agent::{AgentError, AgentLaunch, AgentLauncher, ProcessLauncher, RunningAgent},
    cli::output,
    core::{Job, JobId, JobState, LoadError, Pipeline, RunOutcome},
    execution::{
        config::{OutputSink, RunConfig},
        graph::JobGraph,
        planner::{PlanError, Planner},
        scheduler::{Scheduler, SchedulerEvent},
    },
    server::{BuildContext, ProtocolServer},
};
use indicatif::ProgressBar;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Token the agent registers with; the local server accepts anything
pub const AGENT_TOKEN: &str = "local";

/// Errors that end a run before or outside of job execution
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol server failed to start: {0}")]
    Server(#[source] std::io::Error),
}

/// Final state of a run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// Every job in graph order, with final states
    pub jobs: Vec<Job>,
    /// `(dependent, dependency)` pairs, including spliced uploads
    pub edges: Vec<(JobId, JobId)>,
    pub counts: BTreeMap<JobState, usize>,
    /// `job_id -> agent_id` for jobs handed to an agent
    pub assignments: BTreeMap<JobId, String>,
    pub workers: usize,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn count(&self, state: JobState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    /// First job with the given label
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn jobs_named(&self, name: &str) -> Vec<&Job> {
        self.jobs.iter().filter(|j| j.name == name).collect()
    }

    pub fn job_by_id(&self, id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| &j.id == id)
    }
}

/// Outcome of a finished (not canceled) graph
fn outcome_of(jobs: &[Job]) -> RunOutcome {
    if jobs.iter().any(|j| j.state.is_failure()) {
        RunOutcome::Failed
    } else {
        RunOutcome::Passed
    }
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(&SchedulerEvent) + Send + Sync>;

/// Runs pipelines end to end
pub struct Orchestrator {
    launcher: Arc<dyn AgentLauncher>,
    event_handlers: Vec<EventHandler>,
    cancel: CancellationToken,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(Arc::new(ProcessLauncher::default()))
    }
}

impl Orchestrator {
    pub fn new(launcher: Arc<dyn AgentLauncher>) -> Self {
        Self {
            launcher,
            event_handlers: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Add an event handler, called for every scheduler event
    pub fn with_event_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&SchedulerEvent) + Send + Sync + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
        self
    }

    /// Token that cancels the run in progress and any later one. Ctrl-C and
    /// SIGTERM cancel only the run they interrupt.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute the pipeline at `config.pipeline_path`
    pub async fn run(&self, config: RunConfig) -> Result<RunSummary, RunError> {
        let pipeline = Pipeline::from_file(&config.pipeline_path)?;
        info!(
            path = %config.pipeline_path.display(),
            steps = pipeline.step_count(),
            "pipeline loaded"
        );

        let planner = Planner::new().with_ambient_env(config.env.clone());
        let plan = planner.plan(&pipeline)?;
        let workers = config.resolve_workers(plan.max_concurrency());
        info!(jobs = plan.len(), workers, "pipeline planned");

        if config.dry_run {
            for line in output::render_plan(&plan, workers) {
                config.output.line(line);
            }
            return Ok(RunSummary {
                outcome: RunOutcome::Planned,
                counts: count_states(&plan.jobs),
                jobs: plan.jobs,
                edges: plan.edges,
                assignments: BTreeMap::new(),
                workers,
            });
        }

        let binary = self.launcher.locate(config.agent_binary.as_deref())?;
        info!(binary = %binary.display(), "using agent");

        // Held until the run is over; dropping it removes the directory
        let (build_dir, _temp_dir) = match &config.build_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                (dir.clone(), None)
            }
            None => {
                let dir = tempfile::Builder::new().prefix("bk-local-").tempdir()?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };
        let build = BuildContext::new(
            &build_dir,
            config.checkout_dir(),
            config.resolve_branch().await,
            config.resolve_commit().await,
        );

        let cancel = self.cancel.child_token();
        let graph = Arc::new(JobGraph::from_plan(plan)?);
        let scheduler = Arc::new(
            Scheduler::new(graph.clone(), workers, cancel.clone()).with_planner(planner),
        );
        let events = scheduler.subscribe();

        let server = ProtocolServer::start(config.port, scheduler.clone(), build, config.accept_timeout)
            .await
            .map_err(RunError::Server)?;

        let mut scheduler_task = tokio::spawn(scheduler.clone().run());
        let signals = tokio::spawn(watch_signals(cancel.clone()));

        let launch = AgentLaunch {
            binary,
            endpoint: server.endpoint().to_string(),
            token: AGENT_TOKEN.to_string(),
            workers,
            build_dir: build_dir.clone(),
            name: format!("bk-local-{}", std::process::id()),
            env: BTreeMap::new(),
        };
        let mut agent = match self.launcher.launch(&launch).await {
            Ok(agent) => agent,
            Err(e) => {
                error!(error = %e, "agent failed to start");
                cancel.cancel();
                let _ = scheduler_task.await;
                signals.abort();
                server.shutdown().await;
                return Err(e.into());
            }
        };

        let progress = tokio::spawn(report_progress(
            events,
            scheduler.clone(),
            config.output.clone(),
            config.progress.then(|| output::create_progress_bar(0)),
            self.event_handlers.clone(),
            config.stats_interval,
        ));

        let mut agent_lost = false;
        tokio::select! {
            result = &mut scheduler_task => {
                if let Err(e) = result {
                    error!(error = %e, "scheduler task failed");
                }
            }
            status = agent.wait() => {
                warn!(?status, "agent exited before the build finished");
                agent_lost = true;
                cancel.cancel();
                let _ = scheduler_task.await;
            }
        }

        let canceled = cancel.is_cancelled();
        if canceled {
            let canceled_jobs = graph.cancel_unstarted().await;
            if !canceled_jobs.is_empty() {
                info!(jobs = canceled_jobs.len(), "canceled jobs not yet started");
            }
        }

        // The server stays up while the agent winds down, so jobs it is
        // still running can report their exit.
        stop_agent(&mut *agent).await;
        if canceled {
            let abandoned = graph.cancel_remaining().await;
            if !abandoned.is_empty() {
                warn!(jobs = abandoned.len(), "agent stopped without finishing jobs");
            }
        }
        signals.abort();
        if let Err(e) = progress.await {
            debug!(error = %e, "progress reporter stopped");
        }
        let assignments = server.assignments();
        server.shutdown().await;

        let jobs = graph.snapshot().await;
        let edges = graph.edges().await;
        let outcome = if agent_lost {
            RunOutcome::Failed
        } else if canceled {
            RunOutcome::Canceled
        } else {
            outcome_of(&jobs)
        };

        let summary = RunSummary {
            outcome,
            counts: graph.counts().await,
            jobs,
            edges,
            assignments,
            workers,
        };
        for line in output::render_summary(&summary) {
            config.output.line(line);
        }
        info!(outcome = ?summary.outcome, exit_code = summary.exit_code(), "run finished");
        Ok(summary)
    }
}

fn count_states(jobs: &[Job]) -> BTreeMap<JobState, usize> {
    let mut counts: BTreeMap<JobState, usize> = JobState::ALL.iter().map(|s| (*s, 0)).collect();
    for job in jobs {
        *counts.entry(job.state).or_default() += 1;
    }
    counts
}

async fn stop_agent(agent: &mut dyn RunningAgent) {
    if let Err(e) = agent.terminate().await {
        warn!(error = %e, "failed to stop agent");
    }
    match agent.wait().await {
        Ok(code) => debug!(?code, "agent stopped"),
        Err(e) => debug!(error = %e, "agent already gone"),
    }
}

/// Cancel the run on Ctrl-C or SIGTERM
async fn watch_signals(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio::signal::ctrl_c() => {
            if result.is_err() {
                // No signal handling available; wait for a programmatic cancel
                cancel.cancelled().await;
                return;
            }
        }
        _ = terminate => {}
    }
    warn!("interrupted, canceling run");
    cancel.cancel();
}

/// Print scheduler events as they happen and sample stats for the progress bar
async fn report_progress(
    mut events: broadcast::Receiver<SchedulerEvent>,
    scheduler: Arc<Scheduler>,
    sink: OutputSink,
    bar: Option<ProgressBar>,
    handlers: Vec<EventHandler>,
    interval: Duration,
) {
    let print = |line: String| match &bar {
        Some(bar) => bar.println(line),
        None => sink.line(line),
    };

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    for handler in &handlers {
                        handler(&event);
                    }
                    if let Some(line) = describe(&event, &scheduler).await {
                        print(line);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "progress reporter fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                let stats = scheduler.stats().await;
                match &bar {
                    Some(bar) => {
                        bar.set_length(stats.total() as u64);
                        bar.set_position(stats.finished() as u64);
                        bar.set_message(format!("{} running", stats.count(JobState::Running)));
                    }
                    None => debug!(
                        finished = stats.finished(),
                        total = stats.total(),
                        live = stats.live,
                        "progress"
                    ),
                }
            }
        }
    }

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
}

async fn describe(event: &SchedulerEvent, scheduler: &Scheduler) -> Option<String> {
    match event {
        SchedulerEvent::JobStarted { id } => {
            let job = scheduler.graph().get(id).await?;
            Some(output::format_job_started(&job.name))
        }
        SchedulerEvent::JobFinished {
            id,
            state,
            exit_code,
        } => {
            let job = scheduler.graph().get(id).await?;
            // Barriers and other local jobs are noise in the log
            if !job.is_executable() && *state == JobState::Passed {
                return None;
            }
            Some(output::format_job_finished(&job.name, *state, *exit_code))
        }
        SchedulerEvent::PipelineUpload { inserted, .. } => Some(output::format_upload(inserted.len())),
    }
}
