//! Parameter-server cluster launcher
//!
//! This crate starts a distributed job in two phases:
//! - **Servers**: picks a free rendezvous port and starts the parameter
//!   servers as one process group under the configured scheduling method
//! - **Handshake**: runs the proxy program that waits for every server and
//!   reports their addresses as a single line
//! - **Workers**: runs the user's entry command with that line and the
//!   application config path, in the foreground
//! - **Cleanup**: kills the whole server group exactly once, on success,
//!   failure or interruption
//!
//! # Example
//!
//! ```ignore
//! use launch_core::LaunchConfig;
//! use launcher::LaunchOrchestrator;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LaunchConfig::from_json_file("launch.json")?;
//!     let report = LaunchOrchestrator::new(config).launch().await;
//!     std::process::exit(report.result.exit_code());
//! }
//! ```

pub mod orchestrator;
pub mod port;
pub mod scheduler;
pub mod server_group;
pub mod shutdown;
pub mod worker;

// Re-export main types
pub use orchestrator::LaunchOrchestrator;
pub use port::{system_table, ListeningPorts, NetstatTable, PortAllocator, ProcNetTable};
pub use scheduler::{SchedulerBinding, SchedulerCommand, SchedulerMethod};
pub use server_group::{GroupTerminator, KillGroup, ServerGroupHandle, ServerGroupLauncher};
pub use shutdown::ShutdownSignal;
pub use worker::WorkerRunner;
