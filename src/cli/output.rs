//! CLI output formatting

use crate::core::{Job, JobState, RunOutcome};
use crate::execution::{Plan, RunSummary};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Create a progress bar
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format a job state for display
pub fn format_state(state: JobState) -> String {
    let label = state.as_str().to_uppercase();
    match state {
        JobState::Pending | JobState::Skipped => style(label).dim().to_string(),
        JobState::Waiting | JobState::Running => style(label).yellow().to_string(),
        JobState::Passed => style(label).green().to_string(),
        JobState::Failed | JobState::Broken | JobState::TimedOut => style(label).red().to_string(),
        JobState::Canceled => style(label).yellow().to_string(),
    }
}

fn state_icon(state: JobState) -> Emoji<'static, 'static> {
    match state {
        JobState::Passed => CHECK,
        JobState::Failed | JobState::Broken | JobState::TimedOut => CROSS,
        JobState::Pending | JobState::Waiting | JobState::Running => SPINNER,
        JobState::Skipped | JobState::Canceled => INFO,
    }
}

pub fn format_job_started(name: &str) -> String {
    format!("{} {}", SPINNER, style(name).cyan())
}

pub fn format_job_finished(name: &str, state: JobState, exit_code: Option<i32>) -> String {
    let name = match state {
        JobState::Passed => style(name).green(),
        JobState::Failed | JobState::Broken | JobState::TimedOut => style(name).red(),
        _ => style(name).dim(),
    };
    match exit_code {
        Some(code) if code != 0 => format!(
            "{} {} {} {}",
            state_icon(state),
            name,
            format_state(state),
            style(format!("(exit {code})")).dim()
        ),
        _ => format!("{} {} {}", state_icon(state), name, format_state(state)),
    }
}

pub fn format_upload(inserted: usize) -> String {
    format!(
        "{} Pipeline upload added {} job{}",
        ROCKET,
        style(inserted).bold(),
        if inserted == 1 { "" } else { "s" }
    )
}

fn format_duration(job: &Job) -> String {
    match job.duration() {
        Some(d) => {
            let millis = d.num_milliseconds().max(0);
            if millis < 1000 {
                format!("{millis}ms")
            } else {
                format!("{:.1}s", millis as f64 / 1000.0)
            }
        }
        None => "-".to_string(),
    }
}

/// Truncate a label so listings stay on one terminal line
fn fit(label: &str) -> String {
    let width = term_size::dimensions().map(|(w, _)| w).unwrap_or(100);
    let max = width.saturating_sub(40).max(20);
    if label.chars().count() <= max {
        label.to_string()
    } else {
        let cut: String = label.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

/// Dry-run listing: one line per job in plan order, dependencies given as
/// indices into the listing
pub fn render_plan(plan: &Plan, workers: usize) -> Vec<String> {
    let index: HashMap<_, _> = plan
        .jobs
        .iter()
        .enumerate()
        .map(|(i, job)| (&job.id, i + 1))
        .collect();

    let mut lines = vec![format!(
        "{} Plan: {} jobs, {} worker{}",
        INFO,
        style(plan.len()).bold(),
        workers,
        if workers == 1 { "" } else { "s" }
    )];

    for (i, job) in plan.jobs.iter().enumerate() {
        let mut line = format!("{:>3}. {:<8} {}", i + 1, job.kind.as_str(), fit(&job.name));

        let mut deps: Vec<usize> = plan
            .dependencies_of(&job.id)
            .iter()
            .filter_map(|dep| index.get(dep).copied())
            .collect();
        deps.sort_unstable();
        if !deps.is_empty() {
            let deps: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
            line.push_str(&format!(" {}", style(format!("after {}", deps.join(","))).dim()));
        }
        if !job.matrix_values.is_empty() {
            let values: Vec<String> = job
                .matrix_values
                .iter()
                .map(|(axis, value)| format!("{axis}={value}"))
                .collect();
            line.push_str(&format!(" {}", style(format!("[{}]", values.join(" "))).cyan()));
        }
        if job.parallel_total > 0 {
            line.push_str(&format!(
                " {}",
                style(format!("shard {}/{}", job.parallel_index + 1, job.parallel_total)).cyan()
            ));
        }
        if let Some(group) = &job.concurrency_group {
            line.push_str(&format!(
                " {}",
                style(format!("group {group} (limit {})", job.concurrency_limit.unwrap_or(1))).dim()
            ));
        }
        lines.push(line);
    }
    lines
}

/// End-of-run summary: every job with its state and duration, the totals
/// per state, and the exit code
pub fn render_summary(summary: &RunSummary) -> Vec<String> {
    let mut lines = vec![String::new(), style("Summary").bold().underlined().to_string()];

    for job in &summary.jobs {
        let agent = summary
            .assignments
            .get(&job.id)
            .map(|agent| format!(" {}", style(format!("on {agent}")).dim()))
            .unwrap_or_default();
        lines.push(format!(
            "{} {:<40} {:<10} {:>8}{}",
            state_icon(job.state),
            fit(&job.name),
            format_state(job.state),
            format_duration(job),
            agent
        ));
    }

    let totals: Vec<String> = summary
        .counts
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(state, n)| format!("{n} {state}"))
        .collect();
    lines.push(format!("{} {}", INFO, totals.join(", ")));

    let outcome = match summary.outcome {
        RunOutcome::Passed => format!("{} {}", CHECK, style("Build passed").green().bold()),
        RunOutcome::Failed => format!("{} {}", CROSS, style("Build failed").red().bold()),
        RunOutcome::Canceled => format!("{} {}", WARN, style("Build canceled").yellow().bold()),
        RunOutcome::Planned => format!("{} {}", INFO, style("Dry run").bold()),
    };
    lines.push(format!(
        "{} {}",
        outcome,
        style(format!("(exit code {})", summary.exit_code())).dim()
    ));
    lines
}
