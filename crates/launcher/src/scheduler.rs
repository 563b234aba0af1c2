//! Scheduling-method binding
//!
//! Turns a method name and its resource parameters into the argv prefix that
//! starts N copies of a program. The process count is appended by the caller,
//! so the same binding serves the server and the worker command.

use std::fmt;
use std::str::FromStr;

use launch_core::{Error, MethodConfig, ProgramConfig, Result};
use tokio::process::Command;

/// Backend responsible for placing and starting processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerMethod {
    /// N copies on this machine
    Local,

    /// N copies across the hosts of a host file
    Mpi,

    /// N tasks brokered by an external resource manager
    ResourceManager,
}

impl SchedulerMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerMethod::Local => "local",
            SchedulerMethod::Mpi => "mpi",
            SchedulerMethod::ResourceManager => "mesos",
        }
    }
}

impl FromStr for SchedulerMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(SchedulerMethod::Local),
            "mpi" => Ok(SchedulerMethod::Mpi),
            "mesos" => Ok(SchedulerMethod::ResourceManager),
            other => Err(Error::UnsupportedMethod {
                method: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for SchedulerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved launch prefix for one scheduling method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerCommand {
    method: SchedulerMethod,
    prefix: Vec<String>,
}

impl SchedulerCommand {
    pub fn method(&self) -> SchedulerMethod {
        self.method
    }

    /// Tokens preceding the process count
    pub fn prefix(&self) -> &[String] {
        &self.prefix
    }

    /// Full argv: prefix, process count, then the program and its arguments
    pub fn argv<I, S>(&self, count: u32, program: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = self.prefix.clone();
        argv.push(count.to_string());
        argv.extend(program.into_iter().map(Into::into));
        argv
    }
}

/// Build a process command from an argv without going through a shell
pub(crate) fn command_from_argv(argv: &[String]) -> Command {
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    command
}

/// Resolves scheduling methods against the configured starter programs
#[derive(Debug, Clone)]
pub struct SchedulerBinding {
    programs: ProgramConfig,
}

impl SchedulerBinding {
    pub fn new(programs: ProgramConfig) -> Self {
        Self { programs }
    }

    /// Resolve a method name and its parameters into a launch prefix
    pub fn resolve(
        &self,
        method: &str,
        memory_limit_mb: u64,
        procs_per_node: u32,
        host_file: Option<&str>,
    ) -> Result<SchedulerCommand> {
        let method: SchedulerMethod = method.parse()?;

        let prefix = match method {
            SchedulerMethod::Local => self.starter(method, &self.programs.local_starter)?,
            SchedulerMethod::Mpi => {
                let host_file = host_file
                    .filter(|h| !h.is_empty())
                    .unwrap_or(&self.programs.default_host_file);
                let mut prefix = self.starter(method, &self.programs.mpi_starter)?;
                prefix.extend([
                    "--hostfile".to_string(),
                    expand_home(host_file),
                    "-n".to_string(),
                ]);
                prefix
            }
            SchedulerMethod::ResourceManager => {
                let mut prefix = self.starter(method, &self.programs.resource_manager_starter)?;
                prefix.extend([
                    "-m".to_string(),
                    memory_limit_mb.to_string(),
                    "-p".to_string(),
                    procs_per_node.to_string(),
                    "-n".to_string(),
                ]);
                prefix
            }
        };

        Ok(SchedulerCommand { method, prefix })
    }

    /// Resolve a complete method configuration
    pub fn resolve_config(&self, config: &MethodConfig) -> Result<SchedulerCommand> {
        self.resolve(
            &config.method,
            config.memory_limit_mb,
            config.procs_per_node,
            config.host_file.as_deref(),
        )
    }

    fn starter(&self, method: SchedulerMethod, tokens: &[String]) -> Result<Vec<String>> {
        if tokens.first().map_or(true, |program| program.is_empty()) {
            return Err(Error::InvalidConfig {
                message: format!("no starter program configured for method `{}`", method),
            });
        }
        Ok(tokens.to_vec())
    }
}

/// Expand a leading `~/` against `$HOME`
fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) if !home.is_empty() => {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        }
        _ => path.to_string(),
    }
}
