//! Mock agent for deterministic, fast end-to-end tests
//!
//! Speaks the agent protocol against the local server over real HTTP, the
//! same way `buildkite-agent start` does, but runs each job by asking a
//! closure for its outcome instead of executing commands.

use async_trait::async_trait;
use bk_local::agent::{AgentError, AgentLaunch, AgentLauncher, RunningAgent};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A job as the mock agent received it
#[derive(Debug, Clone)]
pub struct MockJob {
    pub id: String,
    pub label: String,
    pub command: String,
    pub env: BTreeMap<String, String>,
}

/// What running a job should look like
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub exit_status: i32,
    /// Pipeline YAML uploaded while the job runs
    pub upload: Option<String>,
    pub delay: Duration,
}

impl JobOutcome {
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_status: code,
            ..Self::default()
        }
    }

    pub fn with_upload(mut self, yaml: &str) -> Self {
        self.upload = Some(yaml.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A job the mock agent ran to completion
#[derive(Debug, Clone)]
pub struct ExecutedJob {
    pub job: MockJob,
    pub exit_status: i32,
    /// Position in start order
    pub started: usize,
    /// Position in finish order
    pub finished: usize,
}

type Behavior = Arc<dyn Fn(&MockJob) -> JobOutcome + Send + Sync>;

#[derive(Default)]
struct Journal {
    executed: Mutex<Vec<ExecutedJob>>,
    upload_statuses: Mutex<Vec<u16>>,
    launches: Mutex<Vec<AgentLaunch>>,
    starts: AtomicUsize,
    finishes: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Launcher handing out in-process agents
#[derive(Clone)]
pub struct MockLauncher {
    behavior: Behavior,
    journal: Arc<Journal>,
    /// Leave handed-out jobs unaccepted
    ignore_jobs: bool,
}

impl MockLauncher {
    pub fn new<F>(behavior: F) -> Self
    where
        F: Fn(&MockJob) -> JobOutcome + Send + Sync + 'static,
    {
        Self {
            behavior: Arc::new(behavior),
            journal: Arc::new(Journal::default()),
            ignore_jobs: false,
        }
    }

    /// Every job passes
    pub fn passing() -> Self {
        Self::new(|_| JobOutcome::pass())
    }

    /// An agent that takes jobs off the queue and never accepts them
    pub fn unresponsive() -> Self {
        Self {
            ignore_jobs: true,
            ..Self::passing()
        }
    }

    /// Jobs in finish order
    pub fn executed(&self) -> Vec<ExecutedJob> {
        let mut jobs = self.journal.executed.lock().unwrap().clone();
        jobs.sort_by_key(|j| j.finished);
        jobs
    }

    pub fn executed_labels(&self) -> Vec<String> {
        self.executed().into_iter().map(|j| j.job.label).collect()
    }

    pub fn find(&self, label: &str) -> Option<ExecutedJob> {
        self.executed().into_iter().find(|j| j.job.label == label)
    }

    /// Most jobs that were running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.journal.peak.load(Ordering::SeqCst)
    }

    pub fn upload_statuses(&self) -> Vec<u16> {
        self.journal.upload_statuses.lock().unwrap().clone()
    }

    pub fn launches(&self) -> Vec<AgentLaunch> {
        self.journal.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentLauncher for MockLauncher {
    fn locate(&self, explicit: Option<&Path>) -> Result<PathBuf, AgentError> {
        Ok(explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("mock-buildkite-agent")))
    }

    async fn launch(&self, launch: &AgentLaunch) -> Result<Box<dyn RunningAgent>, AgentError> {
        self.journal.launches.lock().unwrap().push(launch.clone());

        let stop = CancellationToken::new();
        let agent = AgentLoop {
            client: reqwest::Client::new(),
            endpoint: launch.endpoint.clone(),
            token: String::new(),
            launcher: self.clone(),
        };
        let handle = tokio::spawn(agent.run(launch.workers, stop.clone()));
        Ok(Box::new(MockRunning {
            stop,
            handle: Some(handle),
        }))
    }
}

struct MockRunning {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

#[async_trait]
impl RunningAgent for MockRunning {
    async fn terminate(&mut self) -> Result<(), AgentError> {
        self.stop.cancel();
        Ok(())
    }

    async fn wait(&mut self) -> Result<Option<i32>, AgentError> {
        if let Some(handle) = self.handle.as_mut() {
            let _ = handle.await;
            self.handle = None;
        }
        Ok(Some(0))
    }
}

#[derive(Clone)]
struct AgentLoop {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    launcher: MockLauncher,
}

impl AgentLoop {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(self.url(path))
            .header("Authorization", format!("Token {}", self.token))
            .json(&body)
            .send()
            .await
    }

    async fn put(&self, path: &str, body: Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .put(self.url(path))
            .header("Authorization", format!("Token {}", self.token))
            .json(&body)
            .send()
            .await
    }

    async fn run(mut self, workers: usize, stop: CancellationToken) {
        if let Ok(response) = self.post("register", json!({"name": "mock", "hostname": "test"})).await {
            if let Ok(body) = response.json::<Value>().await {
                self.token = body["access_token"].as_str().unwrap_or_default().to_string();
            }
        }
        let _ = self.post("connect", json!({})).await;

        let workers = workers.max(1);
        let slots = Arc::new(Semaphore::new(workers));
        loop {
            let permit = tokio::select! {
                _ = stop.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = match self.post("ping", json!({})).await {
                Ok(response) => response.json::<Value>().await.ok().and_then(|b| {
                    let job = b.get("job")?;
                    (!job.is_null()).then(|| job.clone())
                }),
                Err(_) => None,
            };

            match job {
                Some(job) if !self.launcher.ignore_jobs => {
                    let agent = self.clone();
                    tokio::spawn(async move {
                        agent.execute(job).await;
                        drop(permit);
                    });
                }
                _ => {
                    drop(permit);
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
            }
        }
        // Graceful stop: jobs already running finish and report first
        let _ = slots.acquire_many(workers as u32).await;
        let _ = self.post("disconnect", json!({})).await;
    }

    async fn execute(&self, descriptor: Value) {
        let id = descriptor["id"].as_str().unwrap_or_default().to_string();
        let Ok(accepted) = self.put(&format!("jobs/{id}/accept"), json!({})).await else {
            return;
        };
        let Ok(accepted) = accepted.json::<Value>().await else {
            return;
        };

        let env: BTreeMap<String, String> =
            serde_json::from_value(accepted["env"].clone()).unwrap_or_default();
        let job = MockJob {
            id: id.clone(),
            label: env.get("BUILDKITE_LABEL").cloned().unwrap_or_default(),
            command: accepted["step"]["command"].as_str().unwrap_or_default().to_string(),
            env,
        };
        let outcome = (self.launcher.behavior)(&job);
        let journal = &self.launcher.journal;

        let _ = self.put(&format!("jobs/{id}/start"), json!({})).await;
        let started = journal.starts.fetch_add(1, Ordering::SeqCst);
        let active = journal.active.fetch_add(1, Ordering::SeqCst) + 1;
        journal.peak.fetch_max(active, Ordering::SeqCst);

        let _ = self
            .client
            .post(self.url(&format!("jobs/{id}/chunks?sequence=1&offset=0")))
            .body(format!("~~~ Running {}\n", job.command))
            .send()
            .await;

        if !outcome.delay.is_zero() {
            tokio::time::sleep(outcome.delay).await;
        }

        if let Some(yaml) = &outcome.upload {
            if let Ok(response) = self
                .client
                .post(self.url(&format!("jobs/{id}/pipelines")))
                .header("Content-Type", "text/yaml")
                .body(yaml.clone())
                .send()
                .await
            {
                journal
                    .upload_statuses
                    .lock()
                    .unwrap()
                    .push(response.status().as_u16());
            }
        }

        journal.active.fetch_sub(1, Ordering::SeqCst);
        let finished = journal.finishes.fetch_add(1, Ordering::SeqCst);
        journal.executed.lock().unwrap().push(ExecutedJob {
            job,
            exit_status: outcome.exit_status,
            started,
            finished,
        });

        let _ = self
            .put(
                &format!("jobs/{id}/finish"),
                json!({
                    "exit_status": outcome.exit_status.to_string(),
                    "signal": null,
                    "signal_reason": null,
                    "chunks_failed_count": 0
                }),
            )
            .await;
    }
}
