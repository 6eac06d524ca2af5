// SPDX-License-Identifier: GPL-3.0-only

//! Drive records
//!
//! A `Drive` is the durable representation of one adopted or candidate physical device.
//! Records are owned by the registry and mutated only by the agent on the drive's node.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::labels::{self, LEGACY_VERSION, VERSION_LABEL};
use crate::{Conditions, MajorMinor, ObjectMeta, RegistryObject};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriveState {
    #[default]
    Available,
    Unavailable,
    Ready,
    InUse,
    Released,
    Terminating,
    Lost,
}

impl DriveState {
    /// `Ready` and `InUse` drives have been formatted and mounted by the agent
    pub fn is_adopted(self) -> bool {
        matches!(self, Self::Ready | Self::InUse)
    }
}

impl fmt::Display for DriveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessTier {
    Hot,
    Warm,
    Cold,
    #[default]
    Unknown,
}

impl AccessTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "Hot",
            Self::Warm => "Warm",
            Self::Cold => "Cold",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::str::FromStr for AccessTier {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "hot" => Ok(Self::Hot),
            "warm" => Ok(Self::Warm),
            "cold" => Ok(Self::Cold),
            "unknown" | "" => Ok(Self::Unknown),
            other => Err(anyhow::anyhow!("unknown access tier '{other}'")),
        }
    }
}

/// Operator request to adopt and format a drive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedFormat {
    pub force: bool,
    pub purge: bool,
    pub filesystem: String,
    pub mountpoint: String,
    pub mount_options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveSpec {
    pub requested_format: Option<RequestedFormat>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveStatus {
    pub path: String,
    pub major: u32,
    pub minor: u32,

    pub wwid: String,
    pub serial: String,
    pub serial_long: String,
    pub uevent_serial: String,
    pub model: String,
    pub vendor: String,
    pub dm_name: String,
    #[serde(rename = "dmUUID")]
    pub dm_uuid: String,
    #[serde(rename = "mdUUID")]
    pub md_uuid: String,
    #[serde(rename = "ptUUID")]
    pub pt_uuid: String,
    pub pt_type: String,
    #[serde(rename = "partUUID")]
    pub part_uuid: String,
    pub partition_num: u32,
    #[serde(rename = "fsUUID")]
    pub fs_uuid: String,
    #[serde(rename = "ueventFSUUID")]
    pub uevent_fs_uuid: String,
    pub filesystem: String,
    pub pci_path: String,

    #[serde(rename = "virtual")]
    pub is_virtual: bool,
    pub read_only: bool,
    pub removable: bool,
    pub hidden: bool,
    pub partitioned: bool,
    pub swap_on: bool,
    pub master: String,

    pub mountpoint: String,
    pub mount_options: Vec<String>,
    /// Extra options asked for at format time, reapplied on every remount
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requested_mount_options: Vec<String>,
    pub logical_block_size: u64,
    pub physical_block_size: u64,
    pub total_capacity: u64,
    pub allocated_capacity: u64,
    pub free_capacity: u64,

    pub node_name: String,
    pub topology: BTreeMap<String, String>,
    pub access_tier: AccessTier,
    pub drive_status: DriveState,
    pub conditions: Conditions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Drive {
    pub meta: ObjectMeta,
    pub spec: DriveSpec,
    pub status: DriveStatus,
}

impl Drive {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: ObjectMeta::new(name),
            ..Self::default()
        }
    }

    pub fn major_minor(&self) -> MajorMinor {
        MajorMinor::new(self.status.major, self.status.minor)
    }

    /// Written by a schema that only carried the device path as identity
    pub fn is_legacy(&self) -> bool {
        self.meta.label(VERSION_LABEL) == Some(LEGACY_VERSION)
    }

    /// Volume names bound to this drive through finalizers, in finalizer order
    pub fn volume_names(&self) -> Vec<String> {
        self.meta
            .finalizers
            .iter()
            .filter_map(|f| labels::volume_from_finalizer(f))
            .map(str::to_string)
            .collect()
    }

    pub fn has_volumes(&self) -> bool {
        self.meta
            .finalizers
            .iter()
            .any(|f| labels::volume_from_finalizer(f).is_some())
    }
}

impl RegistryObject for Drive {
    const KIND: &'static str = "drive";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{DATA_PROTECTION_FINALIZER, volume_finalizer};

    #[test]
    fn lists_bound_volumes_from_finalizers() {
        let mut drive = Drive::new("d1");
        drive.meta.add_finalizer(DATA_PROTECTION_FINALIZER);
        assert!(!drive.has_volumes());

        drive.meta.add_finalizer(&volume_finalizer("vol-a"));
        drive.meta.add_finalizer(&volume_finalizer("vol-b"));
        assert!(drive.has_volumes());
        assert_eq!(drive.volume_names(), vec!["vol-a", "vol-b"]);
    }

    #[test]
    fn legacy_detection_uses_version_label() {
        let mut drive = Drive::new("d1");
        assert!(!drive.is_legacy());
        drive.meta.set_label(VERSION_LABEL, LEGACY_VERSION);
        assert!(drive.is_legacy());
    }

    #[test]
    fn access_tier_parses_case_insensitively() {
        assert_eq!("HOT".parse::<AccessTier>().expect("tier"), AccessTier::Hot);
        assert_eq!("".parse::<AccessTier>().expect("tier"), AccessTier::Unknown);
        assert!("lukewarm".parse::<AccessTier>().is_err());
    }
}
