//! bk-local - run Buildkite pipelines locally against a stock buildkite-agent

pub mod agent;
pub mod cli;
pub mod core;
pub mod execution;
pub mod server;

// Re-export commonly used types
pub use agent::{AgentError, AgentLaunch, AgentLauncher, ProcessLauncher, RunningAgent};
pub use core::{Job, JobId, JobState, LoadError, Pipeline, RunOutcome, Step, StepKind};
pub use execution::{
    JobGraph, Orchestrator, Plan, PlanError, Planner, RunConfig, RunError, RunSummary, Scheduler,
    SchedulerEvent,
};
pub use server::{ProtocolError, ProtocolServer};
