// SPDX-License-Identifier: GPL-3.0-only

//! Building drive records from device snapshots

use chrono::{DateTime, Utc};

use storage_types::labels::{
    ACCESS_TIER_LABEL, CREATED_BY, CREATED_BY_LABEL, CURRENT_VERSION, DRIVE_NAME_LABEL,
    NODE_LABEL, PATH_LABEL, VERSION_LABEL,
};
use storage_types::{
    Device, Drive, DriveCondition, DriveStatus, LabelSelector, sanitize_label_value,
};

use crate::config::AgentConfig;

/// Page size for registry listings
pub const LIST_PAGE_SIZE: usize = 500;

pub const XFS: &str = "xfs";

/// Options every adopted drive is mounted with
pub const DRIVE_MOUNT_OPTIONS: [&str; 2] = ["noatime", "prjquota"];

/// Condition reasons
pub mod reason {
    pub const ADDED: &str = "Added";
    pub const NOT_ADDED: &str = "NotAdded";
    pub const MOUNTED: &str = "Mounted";
    pub const NOT_MOUNTED: &str = "NotMounted";
    pub const FORMATTED: &str = "Formatted";
    pub const NOT_FORMATTED: &str = "NotFormatted";
    pub const INITIALIZED: &str = "Initialized";
    pub const MOUNT_FAILED: &str = "MountFailed";
    pub const INVALID: &str = "InvariantViolated";
    pub const READY: &str = "Ready";
    pub const NOT_READY: &str = "NotReady";
    pub const NOT_ADOPTED: &str = "NotAdopted";
    pub const DRIVE_LOST: &str = "DriveLost";
    pub const RELEASED: &str = "Released";
}

pub fn node_selector(config: &AgentConfig) -> LabelSelector {
    LabelSelector::default().with(NODE_LABEL, config.node_name.as_str())
}

/// `DRIVE_MOUNT_OPTIONS` followed by any extra options not already present
pub fn drive_mount_options(extra: &[String]) -> Vec<String> {
    let mut options: Vec<String> = DRIVE_MOUNT_OPTIONS.iter().map(|o| o.to_string()).collect();
    for option in extra {
        if !options.contains(option) {
            options.push(option.clone());
        }
    }
    options
}

/// Fresh record for `device`, before any lifecycle decision
pub fn new_drive(config: &AgentConfig, name: &str, device: &Device) -> Drive {
    let mut drive = Drive::new(name);
    copy_identity(&mut drive.status, device, false);
    copy_state(&mut drive.status, device);
    drive.status.access_tier = config.access_tier;
    drive.status.mountpoint = device.first_mount_point.clone();
    drive.status.mount_options = device.first_mount_options.clone();
    set_capacity(&mut drive.status, device);
    refresh_placement(&mut drive, config, device);
    drive
}

/// Identity attributes. With `fill_only` a recorded value is kept and only empty fields
/// are filled; a partition UUID differing only in case takes the device's spelling.
pub fn copy_identity(status: &mut DriveStatus, device: &Device, fill_only: bool) {
    let copy = |recorded: &mut String, observed: &str| {
        if !fill_only || recorded.is_empty() {
            *recorded = observed.to_string();
        }
    };
    copy(&mut status.wwid, &device.wwid);
    copy(&mut status.serial, &device.serial);
    copy(&mut status.serial_long, &device.serial_long);
    copy(&mut status.uevent_serial, &device.uevent_serial);
    copy(&mut status.model, &device.model);
    copy(&mut status.vendor, &device.vendor);
    copy(&mut status.dm_uuid, &device.dm_uuid);
    copy(&mut status.md_uuid, &device.md_uuid);
    copy(&mut status.pt_uuid, &device.pt_uuid);
    copy(&mut status.pt_type, &device.pt_type);
    copy(&mut status.fs_uuid, &device.fs_uuid);

    if !fill_only
        || status.part_uuid.is_empty()
        || status.part_uuid.eq_ignore_ascii_case(&device.part_uuid)
    {
        status.part_uuid = device.part_uuid.clone();
    }
}

/// Location and state attributes, always taken from the device
pub fn copy_state(status: &mut DriveStatus, device: &Device) {
    status.path = device.path();
    status.major = device.major_minor.major;
    status.minor = device.major_minor.minor;
    status.dm_name = device.dm_name.clone();
    status.partition_num = device.partition_num;
    status.uevent_fs_uuid = device.uevent_fs_uuid.clone();
    status.filesystem = device.fs_type.clone();
    status.pci_path = device.pci_path.clone();
    status.is_virtual = device.is_virtual;
    status.read_only = device.read_only;
    status.removable = device.removable;
    status.hidden = device.hidden;
    status.partitioned = device.partitioned;
    status.swap_on = device.swap_on;
    status.master = device.master.clone();
    status.logical_block_size = device.logical_block_size;
    status.physical_block_size = device.physical_block_size;
}

/// Total from the device, free is whatever volumes have not claimed
pub fn set_capacity(status: &mut DriveStatus, device: &Device) {
    status.total_capacity = if device.total_capacity > 0 {
        device.total_capacity
    } else {
        device.size
    };
    status.free_capacity = status.total_capacity.saturating_sub(status.allocated_capacity);
}

/// Node, topology and labels; stamps the current schema version
pub fn refresh_placement(drive: &mut Drive, config: &AgentConfig, device: &Device) {
    drive.status.node_name = config.node_name.clone();
    drive.status.topology = config.topology();

    let meta = &mut drive.meta;
    meta.set_label(NODE_LABEL, config.node_name.as_str());
    meta.set_label(DRIVE_NAME_LABEL, device.name.as_str());
    meta.set_label(PATH_LABEL, sanitize_label_value(&device.name));
    meta.set_label(ACCESS_TIER_LABEL, drive.status.access_tier.as_str());
    meta.set_label(VERSION_LABEL, CURRENT_VERSION);
    meta.set_label(CREATED_BY_LABEL, CREATED_BY);
}

pub fn set_condition(
    status: &mut DriveStatus,
    kind: DriveCondition,
    value: bool,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    status
        .conditions
        .set(kind.as_str(), value.into(), reason, message, now)
}

/// Owned, Mounted, Formatted and Initialized for a record nobody has adopted yet
pub fn set_candidate_conditions(status: &mut DriveStatus, now: DateTime<Utc>) {
    set_condition(status, DriveCondition::Owned, false, reason::NOT_ADDED, "", now);
    set_mounted_condition(status, "", now);
    set_formatted_condition(status, now);
    set_condition(status, DriveCondition::Initialized, true, reason::INITIALIZED, "", now);
}

/// Mounted follows the mountpoint; `error` explains an empty one
pub fn set_mounted_condition(status: &mut DriveStatus, error: &str, now: DateTime<Utc>) {
    let mountpoint = status.mountpoint.clone();
    if mountpoint.is_empty() {
        set_condition(status, DriveCondition::Mounted, false, reason::NOT_MOUNTED, error, now);
    } else {
        set_condition(status, DriveCondition::Mounted, true, reason::MOUNTED, &mountpoint, now);
    }
}

pub fn set_formatted_condition(status: &mut DriveStatus, now: DateTime<Utc>) {
    let filesystem = status.filesystem.clone();
    if filesystem.is_empty() {
        set_condition(status, DriveCondition::Formatted, false, reason::NOT_FORMATTED, "", now);
    } else {
        set_condition(status, DriveCondition::Formatted, true, reason::FORMATTED, &filesystem, now);
    }
}

#[cfg(test)]
mod tests {
    use storage_testing::fixtures::{GIB, disk};

    use super::*;

    #[test]
    fn fill_only_keeps_recorded_identity() {
        let mut status = DriveStatus {
            serial: "OLD".to_string(),
            part_uuid: "0A1B2C3D-01".to_string(),
            ..DriveStatus::default()
        };
        let device = disk("sdb1", 8, 17, GIB)
            .serial("NEW")
            .wwid("0x5000")
            .partition(1, "0a1b2c3d-01")
            .build();

        copy_identity(&mut status, &device, true);
        assert_eq!(status.serial, "OLD");
        assert_eq!(status.wwid, "0x5000");
        assert_eq!(status.part_uuid, "0a1b2c3d-01");

        copy_identity(&mut status, &device, false);
        assert_eq!(status.serial, "NEW");
    }

    #[test]
    fn new_drive_carries_labels_and_capacity() {
        let config = AgentConfig::for_node("node-1", "/mnt/ld");
        let device = disk("nvme0n1p2", 259, 2, 4 * GIB).build();
        let drive = new_drive(&config, "d1", &device);

        assert_eq!(drive.status.path, "/dev/nvme0n1p2");
        assert_eq!(drive.status.total_capacity, 4 * GIB);
        assert_eq!(drive.status.free_capacity, 4 * GIB);
        assert_eq!(drive.meta.label(PATH_LABEL), Some("nvme0n1p2"));
        assert_eq!(drive.meta.label(ACCESS_TIER_LABEL), Some("Unknown"));
        assert_eq!(drive.meta.label(VERSION_LABEL), Some(CURRENT_VERSION));
        assert_eq!(drive.status.topology.len(), 5);
    }

    #[test]
    fn mount_options_are_deduplicated() {
        assert_eq!(
            drive_mount_options(&["prjquota".to_string(), "nodev".to_string()]),
            vec!["noatime", "prjquota", "nodev"]
        );
    }
}
