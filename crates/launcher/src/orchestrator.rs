//! Launch orchestration
//!
//! Drives one launch through its states:
//!
//! ```text
//! Init -> PortAllocated -> ServersStarting -> ServersReady -> WorkersRunning
//!                                 \________________\_______________\____-> Cleanup -> Completed | Failed
//! ```
//!
//! Every path that reaches `ServersStarting` passes through `Cleanup`, where
//! the server group is terminated exactly once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use launch_core::{
    AllocatedPort, Error, HandshakeInfo, LaunchConfig, LaunchId, LaunchReport, LaunchResult,
    LaunchState, Result,
};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::port::PortAllocator;
use crate::scheduler::{SchedulerBinding, SchedulerCommand};
use crate::server_group::{GroupTerminator, KillGroup, ServerGroupHandle, ServerGroupLauncher};
use crate::shutdown::ShutdownSignal;
use crate::worker::WorkerRunner;

/// Progress of one launch attempt
struct Attempt {
    launch_id: LaunchId,
    state: LaunchState,
    furthest: LaunchState,
    port: Option<AllocatedPort>,
    server_info: Option<HandshakeInfo>,
    server_group_terminated: bool,
    started_at: DateTime<Utc>,
}

impl Attempt {
    fn new() -> Self {
        Self {
            launch_id: Uuid::new_v4(),
            state: LaunchState::Init,
            furthest: LaunchState::Init,
            port: None,
            server_info: None,
            server_group_terminated: false,
            started_at: Utc::now(),
        }
    }

    fn advance(&mut self, next: LaunchState) {
        info!(from = %self.state, to = %next, "Launch state transition");
        self.state = next;
        if next != LaunchState::Cleanup && !next.is_terminal() {
            self.furthest = next;
        }
    }

    fn finish(mut self, outcome: Result<()>) -> LaunchReport {
        let result = match outcome {
            Ok(()) => {
                self.advance(LaunchState::Completed);
                info!("Launch completed");
                LaunchResult::WorkersCompleted
            }
            Err(e) => {
                self.advance(LaunchState::Failed);
                error!(
                    furthest_state = %self.furthest,
                    pre_spawn = e.is_pre_spawn(),
                    requires_cleanup = e.requires_cleanup(),
                    error = %e,
                    "Launch failed"
                );
                LaunchResult::from(e)
            }
        };

        if self.furthest.has_server_group() && !self.server_group_terminated {
            error!(furthest_state = %self.furthest, "Server group was not torn down");
        }

        LaunchReport {
            launch_id: self.launch_id,
            result,
            final_state: self.state,
            furthest_state: self.furthest,
            port: self.port,
            server_info: self.server_info,
            server_group_terminated: self.server_group_terminated,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Sequences port allocation, server start, handshake, worker run and cleanup
pub struct LaunchOrchestrator {
    config: LaunchConfig,
    ports: PortAllocator,
    terminator: Arc<dyn GroupTerminator>,
    hostname: Option<String>,
}

impl LaunchOrchestrator {
    /// Create an orchestrator using the system socket table and SIGKILL teardown
    pub fn new(config: LaunchConfig) -> Self {
        let ports = PortAllocator::new(config.port_allocation_attempts);
        Self {
            config,
            ports,
            terminator: Arc::new(KillGroup),
            hostname: None,
        }
    }

    /// Use a custom port allocator
    pub fn with_port_allocator(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    /// Use a custom group terminator
    pub fn with_terminator(mut self, terminator: Arc<dyn GroupTerminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Advertise this host to the servers instead of the machine hostname
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Run a launch, tearing down on SIGINT or SIGTERM
    pub async fn launch(&self) -> LaunchReport {
        match ShutdownSignal::install() {
            Ok(mut shutdown) => self.launch_until(async move { shutdown.recv().await }).await,
            Err(e) => {
                let attempt = Attempt::new();
                let span = info_span!("launch", launch_id = %attempt.launch_id);
                span.in_scope(|| attempt.finish(Err(e)))
            }
        }
    }

    /// Run a launch that is abandoned (with cleanup) when `shutdown` resolves
    ///
    /// The future's output names the cause and ends up in `Error::Interrupted`.
    pub async fn launch_until<F>(&self, shutdown: F) -> LaunchReport
    where
        F: Future<Output = &'static str>,
    {
        let mut attempt = Attempt::new();
        let span = info_span!("launch", launch_id = %attempt.launch_id);

        let outcome = self
            .drive(&mut attempt, shutdown)
            .instrument(span.clone())
            .await;

        span.in_scope(|| attempt.finish(outcome))
    }

    async fn drive<F>(&self, attempt: &mut Attempt, shutdown: F) -> Result<()>
    where
        F: Future<Output = &'static str>,
    {
        self.config.validate()?;

        // Both bindings are resolved up front so a bad method spawns nothing
        let binding = SchedulerBinding::new(self.config.programs.clone());
        let server_scheduler = binding.resolve_config(&self.config.server)?;
        let worker_scheduler = binding.resolve_config(&self.config.worker_method())?;

        let mut servers = ServerGroupLauncher::new(
            server_scheduler,
            &self.config.programs,
            self.config.handshake_timeout,
            Arc::clone(&self.terminator),
        )?;
        if let Some(hostname) = &self.hostname {
            servers = servers.with_hostname(hostname.clone());
        }

        let port = self.ports.allocate()?;
        attempt.port = Some(port);
        attempt.advance(LaunchState::PortAllocated);

        let mut handle = servers.start(&self.config, port)?;
        attempt.advance(LaunchState::ServersStarting);

        let shutdown = std::pin::pin!(shutdown);
        let outcome = self
            .run_with_servers(attempt, &servers, &mut handle, worker_scheduler, shutdown)
            .await;

        attempt.advance(LaunchState::Cleanup);
        attempt.server_group_terminated = handle.terminate();
        outcome
    }

    async fn run_with_servers<F>(
        &self,
        attempt: &mut Attempt,
        servers: &ServerGroupLauncher,
        handle: &mut ServerGroupHandle,
        worker_scheduler: SchedulerCommand,
        mut shutdown: Pin<&mut F>,
    ) -> Result<()>
    where
        F: Future<Output = &'static str>,
    {
        let server_info = tokio::select! {
            info = servers.handshake(handle, self.config.server_count) => info?,
            signal = &mut shutdown => return Err(interrupted(signal)),
        };
        info!(
            servers = server_info.endpoints().len(),
            server_info = %server_info,
            "Parameter servers ready"
        );
        attempt.server_info = Some(server_info.clone());
        attempt.advance(LaunchState::ServersReady);

        let workers = WorkerRunner::new(worker_scheduler);
        attempt.advance(LaunchState::WorkersRunning);

        let status = tokio::select! {
            status = workers.run(&self.config, &server_info) => status?,
            signal = &mut shutdown => return Err(interrupted(signal)),
        };

        if status.success() {
            Ok(())
        } else {
            Err(Error::WorkerFailed {
                exit_code: status.code(),
            })
        }
    }
}

fn interrupted(signal: &str) -> Error {
    Error::Interrupted {
        signal: signal.to_string(),
    }
}
