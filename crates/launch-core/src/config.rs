//! Launch configuration types

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Complete description of one launch
///
/// Built once, validated, then handed to the orchestrator read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Number of parameter-server processes
    pub server_count: u32,

    /// Number of worker processes
    pub worker_count: u32,

    /// Scheduling method for the parameter servers
    pub server: MethodConfig,

    /// Scheduling method for the workers; unset fields use `server`
    pub worker: MethodOverrides,

    /// Worker program and its arguments, passed through untouched
    pub entry_command: Vec<String>,

    /// Algorithm config file forwarded to the workers as `--cfg-file`
    pub config_path: String,

    /// External executables invoked by the launcher
    pub programs: ProgramConfig,

    /// Upper bound on waiting for the server group to report ready
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,

    /// Candidate ports tried before giving up
    pub port_allocation_attempts: u32,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            server_count: 1,
            worker_count: 1,
            server: MethodConfig::default(),
            worker: MethodOverrides::default(),
            entry_command: Vec::new(),
            config_path: String::new(),
            programs: ProgramConfig::default(),
            handshake_timeout: Duration::from_secs(30),
            port_allocation_attempts: 50,
        }
    }
}

impl LaunchConfig {
    /// Load a launch configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), "Loaded launch configuration");
        Ok(config)
    }

    /// Scheduling parameters for the workers, with server-side fallbacks applied
    pub fn worker_method(&self) -> MethodConfig {
        self.worker.resolve_against(&self.server)
    }

    /// Check the invariants the launcher relies on
    pub fn validate(&self) -> Result<()> {
        if self.server_count == 0 {
            return Err(invalid("server_count must be at least 1"));
        }
        if self.worker_count == 0 {
            return Err(invalid("worker_count must be at least 1"));
        }
        if self.entry_command.iter().all(|token| token.trim().is_empty()) {
            return Err(invalid("entry_command must name the worker program"));
        }
        if self.config_path.is_empty() {
            return Err(invalid("config_path must not be empty"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(invalid("handshake_timeout must be positive"));
        }
        if self.port_allocation_attempts == 0 {
            return Err(invalid("port_allocation_attempts must be at least 1"));
        }
        if self.programs.server_binary.is_empty() || self.programs.handshake_binary.is_empty() {
            return Err(invalid("server and handshake binaries must be set"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidConfig {
        message: message.to_string(),
    }
}

/// Scheduling method and its resource parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodConfig {
    /// Method name: `local`, `mpi` or `mesos`
    pub method: String,

    /// Processes per node (resource-manager only)
    pub procs_per_node: u32,

    /// Memory per task in megabytes (resource-manager only)
    pub memory_limit_mb: u64,

    /// Host list for multi-host launches (mpi only)
    pub host_file: Option<String>,
}

impl Default for MethodConfig {
    fn default() -> Self {
        Self {
            method: "local".to_string(),
            procs_per_node: 1,
            memory_limit_mb: 200,
            host_file: None,
        }
    }
}

/// Per-field overrides of a [`MethodConfig`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodOverrides {
    pub method: Option<String>,
    pub procs_per_node: Option<u32>,
    pub memory_limit_mb: Option<u64>,
    pub host_file: Option<String>,
}

impl MethodOverrides {
    /// Fill every unset field from `base`
    pub fn resolve_against(&self, base: &MethodConfig) -> MethodConfig {
        MethodConfig {
            method: self.method.clone().unwrap_or_else(|| base.method.clone()),
            procs_per_node: self.procs_per_node.unwrap_or(base.procs_per_node),
            memory_limit_mb: self.memory_limit_mb.unwrap_or(base.memory_limit_mb),
            host_file: self.host_file.clone().or_else(|| base.host_file.clone()),
        }
    }
}

/// External programs the launcher shells out to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    /// Parameter-server executable
    pub server_binary: String,

    /// Coordination program that prints the server info line
    pub handshake_binary: String,

    /// Complete prefix for the `local` method, count excluded
    pub local_starter: Vec<String>,

    /// Starter tokens for the `mpi` method
    pub mpi_starter: Vec<String>,

    /// Starter tokens for the `mesos` method
    pub resource_manager_starter: Vec<String>,

    /// Host file used by `mpi` when none is configured
    pub default_host_file: String,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            server_binary: "./local/bin/start_server".to_string(),
            handshake_binary: "./local/bin/paracelrun_cpp_proxy".to_string(),
            local_starter: vec!["mpirun".to_string(), "-n".to_string()],
            mpi_starter: vec!["mpirun".to_string()],
            resource_manager_starter: vec!["mrun".to_string()],
            default_host_file: "~/.mpi/large.18".to_string(),
        }
    }
}

/// Builder for LaunchConfig
pub struct LaunchConfigBuilder {
    config: LaunchConfig,
}

impl LaunchConfigBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: LaunchConfig::default(),
        }
    }

    /// Set the number of parameter servers
    pub fn server_count(mut self, count: u32) -> Self {
        self.config.server_count = count;
        self
    }

    /// Set the number of workers
    pub fn worker_count(mut self, count: u32) -> Self {
        self.config.worker_count = count;
        self
    }

    /// Set the server scheduling method (workers inherit it unless overridden)
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.config.server.method = method.into();
        self
    }

    /// Override the worker scheduling method
    pub fn worker_method(mut self, method: impl Into<String>) -> Self {
        self.config.worker.method = Some(method.into());
        self
    }

    /// Set the server host file
    pub fn host_file(mut self, host_file: impl Into<String>) -> Self {
        self.config.server.host_file = Some(host_file.into());
        self
    }

    /// Set the worker program and arguments
    pub fn entry_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.entry_command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set the algorithm config file path
    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.config.config_path = path.into();
        self
    }

    /// Set the external programs
    pub fn programs(mut self, programs: ProgramConfig) -> Self {
        self.config.programs = programs;
        self
    }

    /// Set the handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the port allocation attempt budget
    pub fn port_allocation_attempts(mut self, attempts: u32) -> Self {
        self.config.port_allocation_attempts = attempts;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<LaunchConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for LaunchConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Duration serialization as whole milliseconds
mod duration_ms {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
