//! Loopback server speaking the agent-facing protocol
//!
//! The agent polls [`routes`] for work; handlers translate its lifecycle
//! reports into [`Scheduler`] updates. A background reaper fails jobs that
//! were handed out but never accepted.

pub mod descriptor;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use descriptor::JobDescriptor;
pub use error::ProtocolError;
pub use routes::create_router;
pub use state::{BuildContext, DispatchState, ServerState};

use crate::core::JobState;
use crate::execution::Scheduler;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the reaper looks for unaccepted jobs
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// A running protocol server
pub struct ProtocolServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    serve: JoinHandle<std::io::Result<()>>,
    reaper: JoinHandle<()>,
}

impl ProtocolServer {
    /// Bind to loopback on `port` (0 for any) and start serving
    pub async fn start(
        port: u16,
        scheduler: Arc<Scheduler>,
        mut build: BuildContext,
        accept_timeout: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let addr = listener.local_addr()?;
        build.endpoint = format!("http://{addr}{}", routes::API_PREFIX);

        let state = Arc::new(ServerState::new(scheduler, build));
        let app = create_router(state.clone());
        let shutdown = CancellationToken::new();

        info!(endpoint = %state.build.endpoint, "protocol server listening");

        let token = shutdown.clone();
        let serve = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        });
        let reaper = tokio::spawn(reap_unaccepted(
            state.clone(),
            accept_timeout,
            shutdown.clone(),
        ));

        Ok(Self {
            addr,
            state,
            shutdown,
            serve,
            reaper,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint URL handed to the agent
    pub fn endpoint(&self) -> &str {
        &self.state.build.endpoint
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// `job_id -> agent_id` for every job handed out
    pub fn assignments(&self) -> BTreeMap<crate::core::JobId, String> {
        self.state.assignments()
    }

    /// Stop accepting connections and let in-flight requests finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.reaper.await;
        match self.serve.await {
            Ok(Ok(())) => debug!("protocol server stopped"),
            Ok(Err(e)) => warn!(error = %e, "protocol server stopped with an error"),
            Err(e) => warn!(error = %e, "protocol server task failed"),
        }
    }
}

async fn reap_unaccepted(state: Arc<ServerState>, timeout: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(REAP_INTERVAL.min(timeout.max(Duration::from_millis(10))));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        for id in state.unaccepted_since(timeout) {
            warn!(job = %id, ?timeout, "job was never accepted, failing it");
            state.advance(&id, state::UNKNOWN_AGENT, DispatchState::Completed);
            if let Err(e) = state.scheduler.handle_abandoned(&id, JobState::Failed).await {
                debug!(job = %id, error = %e, "could not fail unaccepted job");
            }
        }
    }
}
