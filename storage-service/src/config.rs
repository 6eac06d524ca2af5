// SPDX-License-Identifier: GPL-3.0-only

//! Agent configuration: an optional TOML file overridden by command-line flags

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use storage_sys::HostPaths;
use storage_types::AccessTier;
use storage_types::labels::{
    TOPOLOGY_IDENTITY, TOPOLOGY_NODE, TOPOLOGY_RACK, TOPOLOGY_REGION, TOPOLOGY_ZONE,
};

pub const DEFAULT_MOUNT_ROOT: &str = "/var/lib/localdrive/mnt";
pub const DEFAULT_STATE_DIR: &str = "/var/lib/localdrive/registry";
const DEFAULT_TOPOLOGY_VALUE: &str = "default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which mounts disqualify an unclaimed device from becoming `Available`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AvailabilityMountPolicy {
    /// Only mounts outside the mount root disqualify
    #[default]
    OutsideMountRoot,
    /// Any mount disqualifies
    NoMounts,
}

#[derive(Debug, Parser)]
#[command(name = "localdrive-agent", version, about = "Per-node local drive agent")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub node_name: Option<String>,
    #[arg(long)]
    pub identity: Option<String>,
    #[arg(long)]
    pub rack: Option<String>,
    #[arg(long)]
    pub zone: Option<String>,
    #[arg(long)]
    pub region: Option<String>,
    #[arg(long)]
    pub mount_root: Option<PathBuf>,
    #[arg(long)]
    pub udev_data_dir: Option<PathBuf>,
    #[arg(long)]
    pub sys_root: Option<PathBuf>,
    #[arg(long)]
    pub proc_root: Option<PathBuf>,
    #[arg(long)]
    pub mountinfo_path: Option<PathBuf>,
    #[arg(long)]
    pub dev_root: Option<PathBuf>,
    #[arg(long)]
    pub resync_interval_secs: Option<u64>,
    /// Manage loop devices as drives
    #[arg(long)]
    pub allow_loopback: bool,
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
    /// Keep registry records in memory only
    #[arg(long)]
    pub in_memory: bool,
    #[arg(long, value_enum)]
    pub availability_mount_policy: Option<AvailabilityMountPolicy>,
    #[arg(long)]
    pub access_tier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub node_name: String,
    /// Defaults to the node name
    pub identity: String,
    pub rack: String,
    pub zone: String,
    pub region: String,
    pub mount_root: PathBuf,
    pub udev_data_dir: PathBuf,
    pub sys_root: PathBuf,
    pub proc_root: PathBuf,
    pub mountinfo_path: PathBuf,
    pub dev_root: PathBuf,
    pub resync_interval_secs: u64,
    pub allow_loopback: bool,
    /// `None` keeps the registry in memory
    pub state_dir: Option<PathBuf>,
    pub availability_mount_policy: AvailabilityMountPolicy,
    pub access_tier: AccessTier,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let host = HostPaths::default();
        Self {
            node_name: String::new(),
            identity: String::new(),
            rack: DEFAULT_TOPOLOGY_VALUE.to_string(),
            zone: DEFAULT_TOPOLOGY_VALUE.to_string(),
            region: DEFAULT_TOPOLOGY_VALUE.to_string(),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            udev_data_dir: host.udev_data_dir,
            sys_root: host.sys_root,
            proc_root: host.proc_root,
            mountinfo_path: host.mountinfo,
            dev_root: host.dev_root,
            resync_interval_secs: 600,
            allow_loopback: false,
            state_dir: Some(PathBuf::from(DEFAULT_STATE_DIR)),
            availability_mount_policy: AvailabilityMountPolicy::default(),
            access_tier: AccessTier::Unknown,
        }
    }
}

impl AgentConfig {
    /// Minimal configuration for `node_name` with everything else defaulted
    pub fn for_node(node_name: &str, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            node_name: node_name.to_string(),
            mount_root: mount_root.into(),
            state_dir: None,
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads the file named by `--config` (if any) and applies flag overrides.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(cli)?;
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, cli: &Cli) -> Result<(), ConfigError> {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }

        set(&mut self.node_name, &cli.node_name);
        set(&mut self.identity, &cli.identity);
        set(&mut self.rack, &cli.rack);
        set(&mut self.zone, &cli.zone);
        set(&mut self.region, &cli.region);
        set(&mut self.mount_root, &cli.mount_root);
        set(&mut self.udev_data_dir, &cli.udev_data_dir);
        set(&mut self.sys_root, &cli.sys_root);
        set(&mut self.proc_root, &cli.proc_root);
        set(&mut self.mountinfo_path, &cli.mountinfo_path);
        set(&mut self.dev_root, &cli.dev_root);
        set(&mut self.resync_interval_secs, &cli.resync_interval_secs);
        set(&mut self.availability_mount_policy, &cli.availability_mount_policy);
        if cli.allow_loopback {
            self.allow_loopback = true;
        }
        if cli.state_dir.is_some() {
            self.state_dir = cli.state_dir.clone();
        }
        if cli.in_memory {
            self.state_dir = None;
        }
        if let Some(tier) = &cli.access_tier {
            self.access_tier = tier
                .parse()
                .map_err(|e: anyhow::Error| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::Invalid("node_name is required".to_string()));
        }
        if !self.mount_root.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "mount_root {:?} must be absolute",
                self.mount_root
            )));
        }
        if self.resync_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "resync_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Mount root without a trailing slash
    pub fn mount_root(&self) -> String {
        let root = self.mount_root.display().to_string();
        match root.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        }
    }

    /// `<mount-root>/<fsUUID>`
    pub fn drive_mount_point(&self, fs_uuid: &str) -> String {
        format!("{}/{}", self.mount_root(), fs_uuid)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn host_paths(&self) -> HostPaths {
        HostPaths {
            udev_data_dir: self.udev_data_dir.clone(),
            sys_root: self.sys_root.clone(),
            proc_root: self.proc_root.clone(),
            mountinfo: self.mountinfo_path.clone(),
            dev_root: self.dev_root.clone(),
        }
    }

    pub fn topology(&self) -> BTreeMap<String, String> {
        let identity = if self.identity.is_empty() {
            &self.node_name
        } else {
            &self.identity
        };
        BTreeMap::from([
            (TOPOLOGY_IDENTITY.to_string(), identity.clone()),
            (TOPOLOGY_RACK.to_string(), self.rack.clone()),
            (TOPOLOGY_ZONE.to_string(), self.zone.clone()),
            (TOPOLOGY_REGION.to_string(), self.region.clone()),
            (TOPOLOGY_NODE.to_string(), self.node_name.clone()),
        ])
    }
}
