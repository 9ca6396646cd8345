//! Planning and execution: plan jobs, track them in a graph, admit them to
//! the agent and drive the run to completion

pub mod config;
pub mod engine;
pub mod graph;
pub mod planner;
pub mod scheduler;

pub use config::{OutputSink, RunConfig, MAX_WORKERS};
pub use engine::{EventHandler, Orchestrator, RunError, RunSummary};
pub use graph::{Completion, JobGraph};
pub use planner::{expand_vars, Plan, PlanError, Planner};
pub use scheduler::{Scheduler, SchedulerEvent, SchedulerStats};
