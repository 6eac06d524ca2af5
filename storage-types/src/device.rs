// SPDX-License-Identifier: GPL-3.0-only

//! Device snapshot model
//!
//! A `Device` is captured from udev data, `/sys`, the mount table and a superblock probe.
//! It is immutable once built and never persisted.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kernel device number pair, printed as `major:minor`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MajorMinor {
    pub major: u32,
    pub minor: u32,
}

impl MajorMinor {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for MajorMinor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

impl FromStr for MajorMinor {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (major, minor) = value
            .trim()
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid major:minor '{value}'"))?;
        Ok(Self {
            major: major.parse()?,
            minor: minor.parse()?,
        })
    }
}

impl TryFrom<String> for MajorMinor {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MajorMinor> for String {
    fn from(value: MajorMinor) -> Self {
        value.to_string()
    }
}

/// Point-in-time view of one block device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    // === Required ===
    /// Kernel name without `/dev/` (e.g. "sdb1")
    pub name: String,
    pub major_minor: MajorMinor,
    pub size: u64,

    // === Identity ===
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
    pub fs_type: String,
    pub pci_path: String,

    // === State ===
    #[serde(rename = "virtual")]
    pub is_virtual: bool,
    pub read_only: bool,
    pub removable: bool,
    pub hidden: bool,
    pub partitioned: bool,
    pub swap_on: bool,
    #[serde(rename = "cdrom")]
    pub cd_rom: bool,
    pub master: String,
    pub holders: Vec<String>,
    pub mount_points: Vec<String>,
    pub first_mount_point: String,
    pub first_mount_options: Vec<String>,
    pub logical_block_size: u64,
    pub physical_block_size: u64,
    pub total_capacity: u64,
    pub free_capacity: u64,

    /// Raw udev key/value record the identity fields were read from
    pub udev_data: BTreeMap<String, String>,
}

impl Device {
    /// Device node path (e.g. "/dev/sdb1")
    pub fn path(&self) -> String {
        format!("/dev/{}", self.name)
    }

    pub fn is_partition(&self) -> bool {
        self.partition_num > 0
    }

    pub fn has_hw_info(&self) -> bool {
        !self.wwid.is_empty() || !self.serial.is_empty() || !self.uevent_serial.is_empty()
    }

    /// True when any mount point lies outside `mount_root`
    pub fn mounted_outside(&self, mount_root: &str) -> bool {
        let prefix = format!("{}/", mount_root.trim_end_matches('/'));
        self.mount_points.iter().any(|mp| !mp.starts_with(&prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_minor_parses_and_prints() {
        let mm: MajorMinor = "8:16".parse().expect("parse major:minor");
        assert_eq!(mm, MajorMinor::new(8, 16));
        assert_eq!(mm.to_string(), "8:16");
        assert!("8".parse::<MajorMinor>().is_err());
        assert!("a:b".parse::<MajorMinor>().is_err());
    }

    #[test]
    fn major_minor_serializes_as_string() {
        let json = serde_json::to_string(&MajorMinor::new(259, 3)).expect("serialize");
        assert_eq!(json, "\"259:3\"");
    }

    #[test]
    fn detects_mounts_outside_root() {
        let mut device = Device {
            name: "sdb".to_string(),
            mount_points: vec!["/var/lib/localdrive/mnt/abc".to_string()],
            ..Device::default()
        };
        assert!(!device.mounted_outside("/var/lib/localdrive/mnt"));

        device.mount_points.push("/home".to_string());
        assert!(device.mounted_outside("/var/lib/localdrive/mnt/"));
    }
}
