//! Execution state models

use serde::{Deserialize, Serialize};

/// State of a single job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for dependencies
    Pending,
    /// Admitted by the scheduler and queued for the agent
    Waiting,
    /// The agent has started it
    Running,
    Passed,
    Failed,
    /// Never ran because a dependency did not succeed
    Broken,
    Skipped,
    Canceled,
    TimedOut,
}

impl JobState {
    pub const ALL: [JobState; 9] = [
        JobState::Pending,
        JobState::Waiting,
        JobState::Running,
        JobState::Passed,
        JobState::Failed,
        JobState::Broken,
        JobState::Skipped,
        JobState::Canceled,
        JobState::TimedOut,
    ];

    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Waiting | JobState::Running)
    }

    /// Whether a dependent may run on the strength of this state alone
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, JobState::Passed | JobState::Skipped)
    }

    /// Terminal states that break dependents which do not tolerate failure
    pub fn breaks_dependents(&self) -> bool {
        matches!(
            self,
            JobState::Failed | JobState::Broken | JobState::Canceled | JobState::TimedOut
        )
    }

    /// Failed or broken: the states that make the run exit non-zero
    pub fn is_failure(&self) -> bool {
        matches!(self, JobState::Failed | JobState::Broken)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Waiting => "waiting",
            JobState::Running => "running",
            JobState::Passed => "passed",
            JobState::Failed => "failed",
            JobState::Broken => "broken",
            JobState::Skipped => "skipped",
            JobState::Canceled => "canceled",
            JobState::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall outcome of a local run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Every job reached a non-failure terminal state
    Passed,
    /// At least one job ended failed or broken
    Failed,
    /// The run was interrupted
    Canceled,
    /// Dry run, nothing executed
    Planned,
}

/// Exit code used when the run is interrupted (128 + SIGINT)
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Passed | RunOutcome::Planned => 0,
            RunOutcome::Failed => 1,
            RunOutcome::Canceled => INTERRUPTED_EXIT_CODE,
        }
    }
}
