//! Configuration document for the monitor daemon.
//!
//! One JSON file carries the local daemon settings, the check definitions,
//! the member roster and the service catalog. The same document is re-read
//! by the reconciler, so every type here derives `PartialEq` to allow
//! structural comparison between snapshots.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which kind of target a check probes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    #[default]
    Site,
    Domain,
    Endpoint,
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckType::Site => write!(f, "site"),
            CheckType::Domain => write!(f, "domain"),
            CheckType::Endpoint => write!(f, "endpoint"),
        }
    }
}

/// A named probe definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Check {
    pub name: String,
    pub check_type: CheckType,
    /// 1 = enabled, anything else disables the check.
    pub enabled: i64,
    /// Lower bound between two runs of the same item, in seconds.
    pub minimum_interval: u64,
    /// Free-form tuning knobs (ConnectTimeout, PingCount, ...). Numbers only.
    pub extra_options: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MemberDetails {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MemberService {
    /// 1 = active.
    pub active: i64,
    #[serde(rename = "ServiceIPv4")]
    pub service_ipv4: String,
    #[serde(rename = "ServiceIPv6")]
    pub service_ipv6: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Membership {
    pub level: i64,
}

/// A provider replica in the federation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Member {
    pub details: MemberDetails,
    pub service: MemberService,
    pub membership: Membership,
    /// Operator override: when set the member is skipped entirely.
    #[serde(rename = "Override")]
    pub override_: bool,
    /// Logical services this member has opted into, grouped by assignment set.
    pub service_assignments: HashMap<String, Vec<String>>,
}

impl Member {
    /// A member participates in checks only while active and not overridden.
    pub fn is_eligible(&self) -> bool {
        self.service.active == 1 && !self.override_
    }

    pub fn assigned_to_service(&self, service_name: &str) -> bool {
        self.service_assignments
            .values()
            .any(|list| list.iter().any(|name| name == service_name))
    }

    /// The member's address for the given family. Empty when not configured.
    pub fn ip(&self, ipv6: bool) -> &str {
        if ipv6 {
            &self.service.service_ipv6
        } else {
            &self.service.service_ipv4
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceConfiguration {
    pub service_type: String,
    pub level_required: i64,
    /// Expected chain identifier, compared case-insensitively by probes.
    pub network_name: String,
    /// Optional expected genesis state root. Empty disables the check.
    pub state_root_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Provider {
    pub rpc_urls: Vec<String>,
}

/// A logical blockchain network offered by the federation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Service {
    pub configuration: ServiceConfiguration,
    pub providers: Vec<Provider>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SystemConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CheckWorkersConfig {
    pub num_workers: i64,
    /// Milliseconds between worker launches.
    pub separation_interval: i64,
}

impl CheckWorkersConfig {
    pub fn workers(&self) -> usize {
        if self.num_workers <= 0 { 10 } else { self.num_workers as usize }
    }

    pub fn separation(&self) -> Duration {
        let ms = if self.separation_interval <= 0 { 1000 } else { self.separation_interval as u64 };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MonitorApiConfig {
    pub listen_address: String,
    pub listen_port: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NatsConfig {
    #[serde(rename = "NodeID")]
    pub node_id: String,
    pub url: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self { node_id: String::new(), url: "nats://127.0.0.1:4222".to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LocalConfig {
    pub system: SystemConfig,
    pub check_workers: CheckWorkersConfig,
    pub checks: Vec<Check>,
    pub monitor_api: MonitorApiConfig,
    pub nats: NatsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub local: LocalConfig,
    pub members: Vec<Member>,
    pub services: HashMap<String, Service>,
}

impl Config {
    /// Parse the configuration document from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Where the reconciler gets fresh configuration snapshots from. The daemon
/// re-reads the config file; tests substitute an in-memory source.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> anyhow::Result<Config>;
}

pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> anyhow::Result<Config> {
        Ok(Config::load(&self.path)?)
    }
}
