//! End-to-end launch scenarios against stub scheduler, server, proxy and worker programs

use anyhow::Result;
use launch_core::{Error, LaunchConfig, LaunchConfigBuilder, LaunchResult, LaunchState, ProgramConfig};
use launcher::{GroupTerminator, KillGroup, LaunchOrchestrator, ListeningPorts, PortAllocator};
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const HOST: &str = "beater7";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Default)]
struct CountingTerminator {
    calls: AtomicUsize,
}

impl GroupTerminator for CountingTerminator {
    fn terminate(&self, pgid: Pid) -> nix::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        KillGroup.terminate(pgid)
    }
}

/// Scratch directory holding the stub programs of one scenario
struct Cluster {
    dir: TempDir,
}

impl Cluster {
    fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn script(&self, name: &str, body: &str) -> Result<String> {
        let path = self.path(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path.display().to_string())
    }

    /// Local starter that records its argv per role, then drops the count and execs the program
    fn local_starter(&self) -> Result<String> {
        let dir = self.dir.path().display();
        self.script(
            "local-starter",
            &format!(
                r#"case "$2" in
  *start_server) out="{dir}/server.argv" ;;
  *) out="{dir}/worker.argv" ;;
esac
printf '%s\n' "$0" "$@" > "$out"
shift
exec "$@""#
            ),
        )
    }

    /// Server stub that records its pid and idles until killed
    fn server(&self) -> Result<String> {
        let pid_file = self.path("server.pid");
        self.script(
            "start_server",
            &format!("echo $$ > \"{}\"\nexec sleep 30", pid_file.display()),
        )
    }

    /// Proxy that reports ready once the server stub is up
    fn ready_proxy(&self) -> String {
        format!(
            "while [ ! -s \"{}\" ]; do sleep 0.05; done\necho \"{}:$4\"",
            self.path("server.pid").display(),
            HOST
        )
    }

    fn programs(&self, proxy_body: &str) -> Result<ProgramConfig> {
        Ok(ProgramConfig {
            local_starter: vec![self.local_starter()?],
            server_binary: self.server()?,
            handshake_binary: self.script("paracelrun_cpp_proxy", proxy_body)?,
            ..ProgramConfig::default()
        })
    }

    fn recorded_argv(&self, role: &str) -> Result<Vec<String>> {
        let raw = std::fs::read_to_string(self.path(&format!("{}.argv", role)))?;
        Ok(raw.lines().map(str::to_string).collect())
    }

    fn server_pid(&self) -> Result<i32> {
        Ok(std::fs::read_to_string(self.path("server.pid"))?.trim().parse()?)
    }
}

fn orchestrator(config: LaunchConfig, terminator: Arc<CountingTerminator>) -> LaunchOrchestrator {
    LaunchOrchestrator::new(config)
        .with_terminator(terminator)
        .with_hostname(HOST)
}

fn never() -> std::future::Pending<&'static str> {
    std::future::pending()
}

/// A process is gone once its /proc entry disappears or it is a zombie awaiting reaping
async fn wait_until_dead(pid: i32) -> bool {
    let stat = PathBuf::from(format!("/proc/{}/stat", pid));
    for _ in 0..50 {
        match std::fs::read_to_string(&stat) {
            Err(_) => return true,
            Ok(line) => {
                let state = line.rsplit(')').next().and_then(|rest| rest.split_whitespace().next());
                if state == Some("Z") {
                    return true;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_local_single_server_single_worker() -> Result<()> {
    init_tracing();
    let cluster = Cluster::new()?;
    let programs = cluster.programs(&cluster.ready_proxy())?;
    let worker = cluster.script("lr_driver", "exit 0")?;
    let config = LaunchConfigBuilder::new()
        .server_count(1)
        .worker_count(1)
        .method("local")
        .entry_command([worker.clone()])
        .config_path("/data/lr.json")
        .programs(programs.clone())
        .build()?;

    let terminator = Arc::new(CountingTerminator::default());
    let report = orchestrator(config, terminator.clone())
        .launch_until(never())
        .await;

    assert!(matches!(report.result, LaunchResult::WorkersCompleted), "{}", report.result);
    assert_eq!(report.final_state, LaunchState::Completed);
    assert_eq!(terminator.calls.load(Ordering::SeqCst), 1);

    let port = report.port.expect("port allocated").to_string();
    assert_eq!(
        cluster.recorded_argv("server")?,
        [
            programs.local_starter[0].as_str(),
            "1",
            programs.server_binary.as_str(),
            "--start-host",
            HOST,
            "--init-port",
            port.as_str(),
        ]
    );

    let info = report.server_info.expect("handshake info");
    assert!(!info.is_empty());
    assert_eq!(info.as_str(), format!("{}:{}", HOST, port));
    assert_eq!(
        cluster.recorded_argv("worker")?,
        [
            programs.local_starter[0].as_str(),
            "1",
            worker.as_str(),
            "--server-info",
            info.as_str(),
            "--cfg-file",
            "/data/lr.json",
        ]
    );

    assert!(wait_until_dead(cluster.server_pid()?).await);
    Ok(())
}

#[tokio::test]
async fn test_unsupported_method_spawns_nothing() -> Result<()> {
    init_tracing();
    let cluster = Cluster::new()?;
    let config = LaunchConfigBuilder::new()
        .method("bogus")
        .entry_command([cluster.script("lr_driver", "exit 0")?])
        .config_path("/data/lr.json")
        .programs(cluster.programs("echo ready")?)
        .build()?;

    let terminator = Arc::new(CountingTerminator::default());
    let report = orchestrator(config, terminator.clone())
        .launch_until(never())
        .await;

    match &report.result {
        LaunchResult::Failed(Error::UnsupportedMethod { method }) => assert_eq!(method, "bogus"),
        other => panic!("unexpected result: {other}"),
    }
    assert_eq!(report.final_state, LaunchState::Failed);
    assert!(report.port.is_none());
    assert_eq!(terminator.calls.load(Ordering::SeqCst), 0);
    assert!(!cluster.path("server.argv").exists());
    assert!(!cluster.path("worker.argv").exists());
    Ok(())
}

#[tokio::test]
async fn test_handshake_timeout_kills_servers_once() -> Result<()> {
    init_tracing();
    let cluster = Cluster::new()?;
    let config = LaunchConfigBuilder::new()
        .server_count(2)
        .entry_command([cluster.script("lr_driver", "exit 0")?])
        .config_path("/data/lr.json")
        .programs(cluster.programs("exec sleep 30")?)
        .handshake_timeout(Duration::from_millis(500))
        .build()?;

    let terminator = Arc::new(CountingTerminator::default());
    let report = orchestrator(config, terminator.clone())
        .launch_until(never())
        .await;

    assert!(matches!(
        report.result,
        LaunchResult::HandshakeTimeout { timeout_ms: 500 }
    ));
    assert_eq!(report.final_state, LaunchState::Failed);
    assert_eq!(report.furthest_state, LaunchState::ServersStarting);
    assert!(report.server_group_terminated);
    assert_eq!(terminator.calls.load(Ordering::SeqCst), 1);
    assert!(!cluster.path("worker.argv").exists());
    assert!(wait_until_dead(cluster.server_pid()?).await);
    Ok(())
}

#[tokio::test]
async fn test_worker_failure_still_kills_servers() -> Result<()> {
    init_tracing();
    let cluster = Cluster::new()?;
    let config = LaunchConfigBuilder::new()
        .entry_command([cluster.script("lr_driver", "exit 1")?])
        .config_path("/data/lr.json")
        .programs(cluster.programs(&cluster.ready_proxy())?)
        .build()?;

    let terminator = Arc::new(CountingTerminator::default());
    let report = orchestrator(config, terminator.clone())
        .launch_until(never())
        .await;

    assert!(matches!(
        report.result,
        LaunchResult::WorkersFailed { exit_code: Some(1) }
    ));
    assert_eq!(report.result.exit_code(), 1);
    assert_eq!(report.furthest_state, LaunchState::WorkersRunning);
    assert_eq!(terminator.calls.load(Ordering::SeqCst), 1);
    assert!(wait_until_dead(cluster.server_pid()?).await);
    Ok(())
}

#[tokio::test]
async fn test_config_file_round_trip_through_launch() -> Result<()> {
    init_tracing();
    let cluster = Cluster::new()?;
    let programs = cluster.programs(&cluster.ready_proxy())?;
    let worker = cluster.script("lr_driver", "exit 0")?;

    let launch_file = cluster.path("launch.json");
    std::fs::write(
        &launch_file,
        format!(
            r#"{{
  "server_count": 1,
  "worker_count": 3,
  "server": {{ "method": "local" }},
  "entry_command": ["{worker}"],
  "config_path": "/data/lr.json",
  "handshake_timeout": 5000,
  "programs": {{
    "local_starter": ["{starter}"],
    "server_binary": "{server}",
    "handshake_binary": "{proxy}"
  }}
}}"#,
            worker = worker,
            starter = programs.local_starter[0],
            server = programs.server_binary,
            proxy = programs.handshake_binary,
        ),
    )?;

    let config = LaunchConfig::from_json_file(&launch_file)?;
    assert_eq!(config.worker_method().method, "local");

    let terminator = Arc::new(CountingTerminator::default());
    let report = orchestrator(config, terminator.clone())
        .launch_until(never())
        .await;

    assert!(report.result.is_success(), "{}", report.result);
    assert_eq!(cluster.recorded_argv("worker")?[1], "3");
    Ok(())
}

#[test]
fn test_listening_port_is_never_allocated() -> Result<()> {
    let port = portpicker::pick_unused_port().expect("no free port");
    let listener = std::net::TcpListener::bind(("127.0.0.1", port))?;

    let table = launcher::system_table();
    assert!(table.listening_ports()?.contains(&port));

    let allocator = PortAllocator::with_table(launcher::system_table(), 5).with_range(port..=port);
    let err = allocator.allocate().unwrap_err();
    assert!(matches!(err, Error::PortAllocationFailed { attempts: 5 }));

    drop(listener);
    Ok(())
}

#[test]
fn test_free_port_is_allocated() -> Result<()> {
    let port = portpicker::pick_unused_port().expect("no free port");
    let allocator = PortAllocator::with_table(launcher::system_table(), 5).with_range(port..=port);
    assert_eq!(allocator.allocate()?.get(), port);
    Ok(())
}
