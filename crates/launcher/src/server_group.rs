//! Parameter-server group lifecycle
//!
//! The server command is spawned as the leader of a fresh process group, so
//! the whole fleet it starts (mpirun daemons, the servers themselves) can be
//! torn down with one signal to the negated group id. [`ServerGroupHandle`]
//! owns that id and is the only way to send the signal.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use launch_core::{AllocatedPort, Error, HandshakeInfo, LaunchConfig, ProgramConfig, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::scheduler::{command_from_argv, SchedulerCommand};

/// Delivers the teardown signal to a process group
pub trait GroupTerminator: Send + Sync {
    fn terminate(&self, pgid: Pid) -> nix::Result<()>;
}

/// SIGKILL to every process in the group
#[derive(Debug, Clone, Copy, Default)]
pub struct KillGroup;

impl GroupTerminator for KillGroup {
    fn terminate(&self, pgid: Pid) -> nix::Result<()> {
        killpg(pgid, Signal::SIGKILL)
    }
}

/// Running parameter-server group
///
/// Terminated at most once: through [`terminate`](Self::terminate), or on drop
/// if it is still armed.
pub struct ServerGroupHandle {
    /// Group id, cleared once the group has been signalled
    pgid: Option<Pid>,

    /// Leader of the group (the scheduler's launch command)
    leader: Child,

    port: AllocatedPort,
    host: String,
    terminator: Arc<dyn GroupTerminator>,
}

impl ServerGroupHandle {
    /// Process group id, `None` after termination
    pub fn pgid(&self) -> Option<Pid> {
        self.pgid
    }

    pub fn port(&self) -> AllocatedPort {
        self.port
    }

    /// Hostname the servers report back to
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_terminated(&self) -> bool {
        self.pgid.is_none()
    }

    /// Signal the whole group
    ///
    /// Returns true if a signal was sent by this call; later calls are no-ops.
    /// Delivery is not verified, failures are logged only.
    pub fn terminate(&mut self) -> bool {
        let Some(pgid) = self.pgid.take() else {
            debug!("Server group already terminated");
            return false;
        };

        match self.terminator.terminate(pgid) {
            Ok(()) => info!(pgid = pgid.as_raw(), "Server group terminated"),
            Err(e) => warn!(
                pgid = pgid.as_raw(),
                error = %e,
                "Failed to signal server group"
            ),
        }
        true
    }

    /// Resolves only if the group leader exits unsuccessfully
    async fn failed_exit(&mut self) -> ExitStatus {
        match self.leader.wait().await {
            Ok(status) if !status.success() => status,
            Ok(status) => {
                debug!(%status, "Server launch command exited");
                std::future::pending().await
            }
            Err(e) => {
                warn!(error = %e, "Cannot wait on server launch command");
                std::future::pending().await
            }
        }
    }
}

impl Drop for ServerGroupHandle {
    fn drop(&mut self) {
        if self.pgid.is_some() {
            warn!("Server group handle dropped while running");
            self.terminate();
        }
    }
}

impl std::fmt::Debug for ServerGroupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerGroupHandle")
            .field("pgid", &self.pgid)
            .field("port", &self.port)
            .field("host", &self.host)
            .finish()
    }
}

/// Starts the server group and waits for it to report ready
pub struct ServerGroupLauncher {
    scheduler: SchedulerCommand,
    server_binary: String,
    handshake_binary: String,
    hostname: String,
    handshake_timeout: Duration,
    terminator: Arc<dyn GroupTerminator>,
}

impl ServerGroupLauncher {
    /// Create a launcher for this machine's hostname
    pub fn new(
        scheduler: SchedulerCommand,
        programs: &ProgramConfig,
        handshake_timeout: Duration,
        terminator: Arc<dyn GroupTerminator>,
    ) -> Result<Self> {
        let hostname = nix::unistd::gethostname()
            .map_err(std::io::Error::from)?
            .to_string_lossy()
            .into_owned();

        Ok(Self {
            scheduler,
            server_binary: programs.server_binary.clone(),
            handshake_binary: programs.handshake_binary.clone(),
            hostname,
            handshake_timeout,
            terminator,
        })
    }

    /// Advertise a different start host to the servers
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Server command: `<prefix> <count> <server> --start-host <host> --init-port <port>`
    pub fn server_argv(&self, server_count: u32, port: AllocatedPort) -> Vec<String> {
        self.scheduler.argv(
            server_count,
            [
                self.server_binary.clone(),
                "--start-host".to_string(),
                self.hostname.clone(),
                "--init-port".to_string(),
                port.to_string(),
            ],
        )
    }

    /// Spawn the server group without waiting for it to become ready
    pub fn start(&self, config: &LaunchConfig, port: AllocatedPort) -> Result<ServerGroupHandle> {
        let argv = self.server_argv(config.server_count, port);
        info!(
            method = %self.scheduler.method(),
            command = %argv.join(" "),
            "Starting parameter servers"
        );

        let spawn_failed = |source| Error::ServerSpawnFailed {
            program: argv[0].clone(),
            source,
        };

        let leader = command_from_argv(&argv)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(spawn_failed)?;

        let pid = leader
            .id()
            .ok_or_else(|| spawn_failed(std::io::Error::other("spawned process has no pid")))?;
        let pgid = Pid::from_raw(pid as i32);

        debug!(pgid = pgid.as_raw(), "Server group spawned");

        Ok(ServerGroupHandle {
            pgid: Some(pgid),
            leader,
            port,
            host: self.hostname.clone(),
            terminator: Arc::clone(&self.terminator),
        })
    }

    /// Coordination command: `<handshake> --nsrv <count> --init-port <port>`
    pub fn handshake_argv(&self, server_count: u32, port: AllocatedPort) -> Vec<String> {
        vec![
            self.handshake_binary.clone(),
            "--nsrv".to_string(),
            server_count.to_string(),
            "--init-port".to_string(),
            port.to_string(),
        ]
    }

    /// Block until the servers report ready and return their connection info
    ///
    /// Runs the coordination program and reads the first line it prints. Fails
    /// with `HandshakeTimeout` when nothing arrives in time and with
    /// `HandshakeFailed` when the program or the server group dies first.
    /// The server group is left running either way; tearing it down is the
    /// caller's job.
    pub async fn handshake(
        &self,
        handle: &mut ServerGroupHandle,
        server_count: u32,
    ) -> Result<HandshakeInfo> {
        let argv = self.handshake_argv(server_count, handle.port());
        info!(command = %argv.join(" "), "Waiting for server handshake");

        let mut proxy = command_from_argv(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::HandshakeFailed {
                reason: format!("cannot spawn `{}`: {}", argv[0], e),
            })?;

        let stdout = proxy.stdout.take().ok_or_else(|| Error::HandshakeFailed {
            reason: "handshake output not captured".to_string(),
        })?;
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();

        let exchange = async {
            tokio::select! {
                read = reader.read_line(&mut line) => read.map_err(Error::from),
                status = handle.failed_exit() => Err(Error::HandshakeFailed {
                    reason: format!("server group exited with {} before reporting ready", status),
                }),
            }
        };

        let bytes = match tokio::time::timeout(self.handshake_timeout, exchange).await {
            Ok(read) => read?,
            Err(_) => {
                return Err(Error::HandshakeTimeout {
                    timeout_ms: u64::try_from(self.handshake_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                })
            }
        };

        let info = HandshakeInfo::new(line);
        if bytes == 0 || info.is_empty() {
            let status = proxy.wait().await?;
            return Err(Error::HandshakeFailed {
                reason: format!("`{}` exited with {} without server info", argv[0], status),
            });
        }

        debug!(server_info = %info, "Handshake received");
        Ok(info)
    }
}
