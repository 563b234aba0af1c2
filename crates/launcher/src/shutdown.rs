//! Termination signal handling
//!
//! Handlers are installed eagerly so a Ctrl+C or SIGTERM that arrives while
//! the server group is starting is still observed and the group torn down.

use launch_core::Result;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::info;

/// Installed SIGINT/SIGTERM listeners
pub struct ShutdownSignal {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignal {
    /// Install the handlers; from here on these signals no longer kill the process
    pub fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the first signal and return its name
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => {
                info!("Received Ctrl+C, tearing down launch");
                "SIGINT"
            }
            _ = self.terminate.recv() => {
                info!("Received SIGTERM, tearing down launch");
                "SIGTERM"
            }
        }
    }
}
