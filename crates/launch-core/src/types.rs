//! Core type definitions for the cluster launcher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::Error;

/// Unique identifier of one launch attempt
pub type LaunchId = Uuid;

/// Separator the parameter servers place between their records
pub const SERVER_INFO_SEPARATOR: &str = "PARACEL";

/// Rendezvous port picked for the server group
///
/// Only a best-effort pick: another process may bind it before the servers do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocatedPort(u16);

impl AllocatedPort {
    pub fn new(port: u16) -> Self {
        Self(port)
    }

    pub fn get(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for AllocatedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server connection info returned by the handshake
///
/// Forwarded verbatim to the workers; the launcher never rewrites it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInfo(String);

impl HandshakeInfo {
    /// Wrap a handshake line, dropping the trailing line terminator
    pub fn new(line: impl Into<String>) -> Self {
        let mut line = line.into();
        let trimmed_len = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed_len);
        Self(line)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Split into per-server records of the form `host:port,port,...`
    ///
    /// Records that do not follow that shape are skipped.
    pub fn endpoints(&self) -> Vec<ServerEndpoint> {
        self.0
            .split(SERVER_INFO_SEPARATOR)
            .filter_map(|record| {
                let (host, ports) = record.trim().split_once(':')?;
                let ports = ports
                    .split(',')
                    .map(|p| p.trim().parse::<u16>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .ok()?;
                Some(ServerEndpoint {
                    host: host.to_string(),
                    ports,
                })
            })
            .collect()
    }
}

impl fmt::Display for HandshakeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One parameter server as announced during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    pub ports: Vec<u16>,
}

/// Launch state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LaunchState {
    /// Nothing done yet
    Init,

    /// Rendezvous port picked
    PortAllocated,

    /// Server group spawned, not yet confirmed ready
    ServersStarting,

    /// Handshake received
    ServersReady,

    /// Worker command running
    WorkersRunning,

    /// Tearing down the server group
    Cleanup,

    /// Workers finished successfully
    Completed,

    /// Launch failed
    Failed,
}

impl LaunchState {
    /// Returns true once a server group may exist and must be torn down
    pub fn has_server_group(&self) -> bool {
        matches!(
            self,
            LaunchState::ServersStarting
                | LaunchState::ServersReady
                | LaunchState::WorkersRunning
                | LaunchState::Cleanup
        )
    }

    /// Returns true for terminal states
    pub fn is_terminal(&self) -> bool {
        matches!(self, LaunchState::Completed | LaunchState::Failed)
    }
}

impl fmt::Display for LaunchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LaunchState::Init => "init",
            LaunchState::PortAllocated => "port_allocated",
            LaunchState::ServersStarting => "servers_starting",
            LaunchState::ServersReady => "servers_ready",
            LaunchState::WorkersRunning => "workers_running",
            LaunchState::Cleanup => "cleanup",
            LaunchState::Completed => "completed",
            LaunchState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of a launch
#[derive(Debug)]
pub enum LaunchResult {
    /// Workers exited zero
    WorkersCompleted,

    /// Workers exited non-zero or were killed by a signal
    WorkersFailed { exit_code: Option<i32> },

    /// The server group could not be spawned
    ServerStartFailed { reason: String },

    /// The server group never reported ready
    HandshakeTimeout { timeout_ms: u64 },

    /// Any other failure
    Failed(Error),
}

impl LaunchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, LaunchResult::WorkersCompleted)
    }

    /// Process exit code to report for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchResult::WorkersCompleted => 0,
            LaunchResult::WorkersFailed {
                exit_code: Some(code),
            } if *code != 0 => *code,
            _ => 1,
        }
    }
}

impl From<Error> for LaunchResult {
    fn from(error: Error) -> Self {
        match error {
            Error::WorkerFailed { exit_code } => LaunchResult::WorkersFailed { exit_code },
            Error::ServerSpawnFailed { .. } => LaunchResult::ServerStartFailed {
                reason: error.to_string(),
            },
            Error::HandshakeTimeout { timeout_ms } => LaunchResult::HandshakeTimeout { timeout_ms },
            other => LaunchResult::Failed(other),
        }
    }
}

impl fmt::Display for LaunchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchResult::WorkersCompleted => f.write_str("workers completed"),
            LaunchResult::WorkersFailed {
                exit_code: Some(code),
            } => write!(f, "workers failed with status {}", code),
            LaunchResult::WorkersFailed { exit_code: None } => {
                f.write_str("workers terminated by signal")
            }
            LaunchResult::ServerStartFailed { reason } => write!(f, "{}", reason),
            LaunchResult::HandshakeTimeout { timeout_ms } => {
                write!(f, "handshake timed out after {}ms", timeout_ms)
            }
            LaunchResult::Failed(error) => write!(f, "{}", error),
        }
    }
}

/// Summary of a finished launch attempt
#[derive(Debug)]
pub struct LaunchReport {
    /// Launch identifier, also recorded on every log line of the launch
    pub launch_id: LaunchId,

    /// Terminal outcome
    pub result: LaunchResult,

    /// State the machine stopped in (`Completed` or `Failed`)
    pub final_state: LaunchState,

    /// Furthest state reached before cleanup
    pub furthest_state: LaunchState,

    /// Rendezvous port, if one was allocated
    pub port: Option<AllocatedPort>,

    /// Handshake line, if the servers reported ready
    pub server_info: Option<HandshakeInfo>,

    /// Whether the server group was signalled during cleanup
    pub server_group_terminated: bool,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
