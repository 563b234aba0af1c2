//! Error types for the cluster launcher

use thiserror::Error;

/// Result type alias using the launcher Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the cluster launcher
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors (nothing spawned)
    #[error("Scheduling method not supported: {method}")]
    UnsupportedMethod { method: String },

    #[error("No free port found after {attempts} attempts")]
    PortAllocationFailed { attempts: u32 },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // Server group errors
    #[error("Failed to spawn server group `{program}`: {source}")]
    ServerSpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake timeout: servers not ready after {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    // Worker errors
    #[error("Failed to spawn workers `{program}`: {source}")]
    WorkerSpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Workers exited with {}", describe_exit(.exit_code))]
    WorkerFailed { exit_code: Option<i32> },

    // Lifecycle errors
    #[error("Launch interrupted by {signal}")]
    Interrupted { signal: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}

impl Error {
    /// Returns true if this error is raised before any process is spawned
    pub fn is_pre_spawn(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedMethod { .. }
                | Error::PortAllocationFailed { .. }
                | Error::InvalidConfig { .. }
                | Error::ServerSpawnFailed { .. }
        )
    }

    /// Returns true if the server group must be torn down after this error
    pub fn requires_cleanup(&self) -> bool {
        matches!(
            self,
            Error::HandshakeTimeout { .. }
                | Error::HandshakeFailed { .. }
                | Error::WorkerSpawnFailed { .. }
                | Error::WorkerFailed { .. }
                | Error::Interrupted { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_spawn_errors() {
        let err = Error::UnsupportedMethod {
            method: "bogus".to_string(),
        };
        assert!(err.is_pre_spawn());
        assert!(!err.requires_cleanup());

        let err = Error::PortAllocationFailed { attempts: 50 };
        assert!(err.is_pre_spawn());
    }

    #[test]
    fn test_cleanup_errors() {
        let err = Error::HandshakeTimeout { timeout_ms: 30_000 };
        assert!(err.requires_cleanup());
        assert!(!err.is_pre_spawn());

        let err = Error::WorkerFailed { exit_code: Some(1) };
        assert!(err.requires_cleanup());
    }

    #[test]
    fn test_worker_failed_message() {
        let err = Error::WorkerFailed { exit_code: Some(3) };
        assert_eq!(err.to_string(), "Workers exited with status 3");

        let err = Error::WorkerFailed { exit_code: None };
        assert!(err.to_string().contains("terminated by signal"));
    }
}
