use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

/// Failures that abort the daemon before the scheduler starts.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration file not found: {0}")]
    ConfigMissing(PathBuf),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("failed to connect to NATS: {0}")]
    BusConnect(#[from] async_nats::ConnectError),
    #[error("failed to enable monitor role: {0}")]
    RoleEnable(String),
}
