//! Launch Core - Foundation for the parameter-server cluster launcher
//!
//! Provides the launch configuration, error taxonomy and the value types
//! passed between the launcher's components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{LaunchConfig, LaunchConfigBuilder, MethodConfig, MethodOverrides, ProgramConfig};
pub use error::{Error, Result};
pub use types::*;
