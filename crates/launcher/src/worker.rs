//! Worker launch
//!
//! Runs the user's entry command under the worker scheduling method and waits
//! for it. Requires a [`HandshakeInfo`], so workers cannot be started before
//! the servers have reported ready.

use std::process::ExitStatus;

use launch_core::{Error, HandshakeInfo, LaunchConfig, Result};
use tracing::{info, warn};

use crate::scheduler::{command_from_argv, SchedulerCommand};

/// Runs the worker group in the foreground
#[derive(Debug, Clone)]
pub struct WorkerRunner {
    scheduler: SchedulerCommand,
}

impl WorkerRunner {
    pub fn new(scheduler: SchedulerCommand) -> Self {
        Self { scheduler }
    }

    /// Worker command: `<prefix> <count> <entry...> --server-info <info> --cfg-file <path>`
    ///
    /// The server info is a single argv token whatever it contains.
    pub fn worker_argv(&self, config: &LaunchConfig, server_info: &HandshakeInfo) -> Vec<String> {
        let program = config
            .entry_command
            .iter()
            .cloned()
            .chain([
                "--server-info".to_string(),
                server_info.as_str().to_string(),
                "--cfg-file".to_string(),
                config.config_path.clone(),
            ]);
        self.scheduler.argv(config.worker_count, program)
    }

    /// Run the workers to completion and return their exit status
    ///
    /// Not retried. Dropping the returned future kills the worker command.
    pub async fn run(&self, config: &LaunchConfig, server_info: &HandshakeInfo) -> Result<ExitStatus> {
        let argv = self.worker_argv(config, server_info);
        info!(
            method = %self.scheduler.method(),
            workers = config.worker_count,
            command = %argv.join(" "),
            "Starting workers"
        );

        let mut child = command_from_argv(&argv)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::WorkerSpawnFailed {
                program: argv[0].clone(),
                source,
            })?;

        let status = child.wait().await?;
        if status.success() {
            info!(%status, "Workers finished");
        } else {
            warn!(%status, "Workers exited unsuccessfully");
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerBinding;
    use launch_core::{LaunchConfigBuilder, ProgramConfig};

    fn runner(local_starter: &[&str]) -> WorkerRunner {
        let programs = ProgramConfig {
            local_starter: local_starter.iter().map(|s| s.to_string()).collect(),
            ..ProgramConfig::default()
        };
        WorkerRunner::new(
            SchedulerBinding::new(programs)
                .resolve("local", 200, 1, None)
                .unwrap(),
        )
    }

    fn config(entry: &[&str]) -> LaunchConfig {
        LaunchConfigBuilder::new()
            .worker_count(2)
            .entry_command(entry.iter().copied())
            .config_path("/data/lr.json")
            .build()
            .unwrap()
    }

    #[test]
    fn test_worker_argv() {
        let runner = runner(&["local-starter"]);
        let info = HandshakeInfo::new("host1:7777PARACELhost 2:8888");
        let argv = runner.worker_argv(&config(&["./lr_driver", "--verbose"]), &info);

        assert_eq!(
            argv,
            [
                "local-starter",
                "2",
                "./lr_driver",
                "--verbose",
                "--server-info",
                "host1:7777PARACELhost 2:8888",
                "--cfg-file",
                "/data/lr.json"
            ]
        );
    }

    #[tokio::test]
    async fn test_run_reports_exit_status() {
        // `sh -c <script> starter 2 <entry...>`: the count lands in $1
        let runner = runner(&["sh", "-c", r#"shift; exec "$@""#, "starter"]);
        let info = HandshakeInfo::new("ready");

        let status = runner.run(&config(&["true"]), &info).await.unwrap();
        assert!(status.success());

        let status = runner
            .run(&config(&["sh", "-c", "exit 1", "worker"]), &info)
            .await
            .unwrap();
        assert_eq!(status.code(), Some(1));
    }

    #[tokio::test]
    async fn test_run_spawn_failure() {
        let runner = runner(&["/nonexistent/local-starter"]);
        let err = runner
            .run(&config(&["./lr_driver"]), &HandshakeInfo::new("ready"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerSpawnFailed { .. }));
    }
}
