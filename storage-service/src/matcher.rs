// SPDX-License-Identifier: GPL-3.0-only

//! Drive to device identity resolution
//!
//! A drive record is matched against the probed devices by the first rule whose
//! precondition holds on the record. That rule alone decides: when it finds nothing the
//! record is unmatched, even if a later rule would have found a candidate.

use storage_types::{Device, Drive, MajorMinor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchRule {
    /// wwid, serial, udev serial (plus model and vendor when recorded)
    HardwareIds,
    /// device-mapper or md UUID
    DeviceMapper,
    /// whole-disk partition table UUID and type
    PartitionTable,
    /// partition entry UUID
    PartitionUuid,
    /// filesystem UUID from the superblock and from udev
    FilesystemUuid,
    /// device path only, for records written by the legacy schema
    LegacyPath,
    /// size, partition number, flags and path
    Attributes,
}

impl MatchRule {
    /// 1 is tried first
    pub fn priority(self) -> u8 {
        match self {
            Self::HardwareIds => 1,
            Self::DeviceMapper => 2,
            Self::PartitionTable => 3,
            Self::PartitionUuid => 4,
            Self::FilesystemUuid => 5,
            Self::LegacyPath => 6,
            Self::Attributes => 7,
        }
    }

    /// The rule that decides for `drive`
    pub fn for_drive(drive: &Drive) -> Self {
        let status = &drive.status;
        if !status.wwid.is_empty() || !status.serial.is_empty() || !status.uevent_serial.is_empty() {
            Self::HardwareIds
        } else if !status.dm_uuid.is_empty() || !status.md_uuid.is_empty() {
            Self::DeviceMapper
        } else if status.partition_num == 0 && !status.pt_uuid.is_empty() {
            Self::PartitionTable
        } else if status.partition_num > 0 && !status.part_uuid.is_empty() {
            Self::PartitionUuid
        } else if !status.fs_uuid.is_empty() || !status.uevent_fs_uuid.is_empty() {
            Self::FilesystemUuid
        } else if drive.is_legacy() {
            Self::LegacyPath
        } else {
            Self::Attributes
        }
    }

    pub fn matches(self, drive: &Drive, device: &Device) -> bool {
        let status = &drive.status;
        let same_partition = status.partition_num == device.partition_num;
        match self {
            Self::HardwareIds => {
                same_partition
                    && recorded_eq(&status.wwid, &device.wwid)
                    && recorded_eq(&status.serial, &device.serial)
                    && recorded_eq(&status.uevent_serial, &device.uevent_serial)
                    && recorded_eq(&status.model, &device.model)
                    && recorded_eq(&status.vendor, &device.vendor)
            }
            Self::DeviceMapper => {
                same_partition
                    && recorded_eq(&status.dm_uuid, &device.dm_uuid)
                    && recorded_eq(&status.md_uuid, &device.md_uuid)
            }
            Self::PartitionTable => {
                device.partition_num == 0
                    && status.pt_uuid == device.pt_uuid
                    && same_table_type(&status.pt_type, &device.pt_type)
            }
            Self::PartitionUuid => {
                same_partition && status.part_uuid.eq_ignore_ascii_case(&device.part_uuid)
            }
            Self::FilesystemUuid => {
                same_partition
                    && status.fs_uuid == device.fs_uuid
                    && status.uevent_fs_uuid == device.uevent_fs_uuid
                    && status.filesystem.eq_ignore_ascii_case(&device.fs_type)
            }
            Self::LegacyPath => status.path == device.path(),
            Self::Attributes => {
                same_partition
                    && status.is_virtual == device.is_virtual
                    && status.read_only == device.read_only
                    && status.total_capacity == device.total_capacity
                    && status.path == device.path()
            }
        }
    }
}

/// Result of matching one record against the candidate pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Exactly one device matched and was removed from the pool
    Matched(Box<Device>),
    NoMatch,
    /// More than one device matched; the pool is left untouched
    Duplicate(Vec<MajorMinor>),
}

/// Matches `drive` against `pool`, removing the matched device on success.
pub fn match_drive(drive: &Drive, pool: &mut Vec<Device>) -> MatchOutcome {
    let rule = MatchRule::for_drive(drive);
    let candidates: Vec<usize> = pool
        .iter()
        .enumerate()
        .filter(|(_, device)| rule.matches(drive, device))
        .map(|(index, _)| index)
        .collect();

    match candidates.as_slice() {
        [] => MatchOutcome::NoMatch,
        [index] => {
            tracing::trace!(
                drive = %drive.meta.name,
                device = %pool[*index].name,
                rule = rule.priority(),
                "drive matched"
            );
            MatchOutcome::Matched(Box::new(pool.remove(*index)))
        }
        many => MatchOutcome::Duplicate(many.iter().map(|i| pool[*i].major_minor).collect()),
    }
}

/// Index of the one pooled device carrying the record's filesystem UUID while udev still
/// reports another one, as it does right after a format until the new superblock has
/// been published.
///
/// Only records decided by [`MatchRule::FilesystemUuid`] qualify; every other rule
/// ignores filesystem identity.
pub fn awaiting_udev(drive: &Drive, pool: &[Device]) -> Option<usize> {
    let status = &drive.status;
    if MatchRule::for_drive(drive) != MatchRule::FilesystemUuid || status.fs_uuid.is_empty() {
        return None;
    }
    let mut candidates = pool.iter().enumerate().filter(|(_, device)| {
        device.partition_num == status.partition_num
            && device.fs_uuid == status.fs_uuid
            && device.uevent_fs_uuid != status.uevent_fs_uuid
    });
    match (candidates.next(), candidates.next()) {
        (Some((index, _)), None) => Some(index),
        _ => None,
    }
}

/// Identity recorded on the drive must match; an empty recorded value matches anything
fn recorded_eq(recorded: &str, observed: &str) -> bool {
    recorded.is_empty() || recorded == observed
}

fn same_table_type(recorded: &str, observed: &str) -> bool {
    fn family(pt_type: &str) -> String {
        match pt_type.to_ascii_lowercase().as_str() {
            "dos" | "msdos" | "mbr" => "dos".to_string(),
            other => other.to_string(),
        }
    }
    family(recorded) == family(observed)
}

#[cfg(test)]
mod tests {
    use storage_testing::fixtures::{GIB, disk, drive_record};
    use storage_types::DriveState;
    use storage_types::labels::{LEGACY_VERSION, VERSION_LABEL};

    use super::*;

    const ROOT: &str = "/var/lib/localdrive/mnt";

    fn matched_name(outcome: MatchOutcome) -> Option<String> {
        match outcome {
            MatchOutcome::Matched(device) => Some(device.name),
            _ => None,
        }
    }

    #[test]
    fn hardware_ids_survive_rename() {
        let old = disk("sdb", 8, 17, 4 * GIB).wwid("0xABCD").partition(1, "p1").build();
        let drive = drive_record("d1", &old, DriveState::Ready, ROOT);
        let renamed = disk("sdc", 9, 33, 4 * GIB).wwid("0xABCD").partition(1, "p1").build();
        let other = disk("sdd", 8, 48, 4 * GIB).wwid("0xFFFF").partition(1, "p9").build();

        let mut pool = vec![other, renamed];
        assert_eq!(MatchRule::for_drive(&drive), MatchRule::HardwareIds);
        assert_eq!(matched_name(match_drive(&drive, &mut pool)).as_deref(), Some("sdc"));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn hardware_rule_requires_same_partition() {
        let recorded = disk("sdb1", 8, 17, GIB).serial("S1").partition(1, "p1").build();
        let drive = drive_record("d1", &recorded, DriveState::Ready, ROOT);
        let mut pool = vec![disk("sdb2", 8, 18, GIB).serial("S1").partition(2, "p2").build()];
        assert_eq!(match_drive(&drive, &mut pool), MatchOutcome::NoMatch);
    }

    #[test]
    fn duplicate_candidates_leave_pool_intact() {
        let a = disk("sdb1", 8, 17, GIB).wwid("X").serial("Y").partition(1, "p1").build();
        let b = disk("sdc1", 8, 33, GIB).wwid("X").serial("Y").partition(1, "p2").build();
        let drive = drive_record("d1", &a, DriveState::Ready, ROOT);

        let mut pool = vec![a, b];
        assert_eq!(
            match_drive(&drive, &mut pool),
            MatchOutcome::Duplicate(vec![MajorMinor::new(8, 17), MajorMinor::new(8, 33)])
        );
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn device_mapper_uuid() {
        let mut dm = disk("dm-3", 253, 3, GIB).build();
        dm.dm_uuid = "LVM-abc".to_string();
        let drive = drive_record("d1", &dm, DriveState::Available, ROOT);
        assert_eq!(MatchRule::for_drive(&drive), MatchRule::DeviceMapper);

        let mut moved = dm.clone();
        moved.name = "dm-4".to_string();
        assert!(MatchRule::DeviceMapper.matches(&drive, &moved));
        moved.dm_uuid = "LVM-def".to_string();
        assert!(!MatchRule::DeviceMapper.matches(&drive, &moved));
    }

    #[test]
    fn dos_partition_table_family_is_collapsed() {
        let recorded = disk("sdb", 8, 16, GIB).partition_table("dos", "1234abcd").build();
        let drive = drive_record("d1", &recorded, DriveState::Unavailable, ROOT);
        assert_eq!(MatchRule::for_drive(&drive), MatchRule::PartitionTable);

        let observed = disk("sdc", 8, 32, GIB).partition_table("MBR", "1234abcd").build();
        assert!(MatchRule::PartitionTable.matches(&drive, &observed));
        let gpt = disk("sdc", 8, 32, GIB).partition_table("gpt", "1234abcd").build();
        assert!(!MatchRule::PartitionTable.matches(&drive, &gpt));
    }

    #[test]
    fn partition_uuid_ignores_case() {
        let mut recorded = disk("sdb1", 8, 17, GIB).partition(1, "0A1B2C3D-01").build();
        recorded.wwid.clear();
        let drive = drive_record("d1", &recorded, DriveState::Available, ROOT);
        assert_eq!(MatchRule::for_drive(&drive), MatchRule::PartitionUuid);

        let observed = disk("sdc1", 8, 33, GIB).partition(1, "0a1b2c3d-01").build();
        assert!(MatchRule::PartitionUuid.matches(&drive, &observed));
    }

    #[test]
    fn filesystem_uuid_wins_over_attributes_on_new_path() {
        let recorded = disk("sdb", 8, 16, 4 * GIB).xfs("X").build();
        let drive = drive_record("X", &recorded, DriveState::Ready, ROOT);
        let moved = disk("sdf", 8, 80, 8 * GIB).xfs("X").build();

        assert_eq!(MatchRule::for_drive(&drive), MatchRule::FilesystemUuid);
        assert!(!MatchRule::Attributes.matches(&drive, &moved));
        let mut pool = vec![moved];
        assert_eq!(matched_name(match_drive(&drive, &mut pool)).as_deref(), Some("sdf"));
    }

    #[test]
    fn filesystem_rule_needs_udev_uuid_too() {
        let recorded = disk("sdb", 8, 16, GIB).xfs("X").build();
        let drive = drive_record("X", &recorded, DriveState::Ready, ROOT);
        let mut stale = recorded.clone();
        stale.uevent_fs_uuid = "Y".to_string();
        assert!(!MatchRule::FilesystemUuid.matches(&drive, &stale));
    }

    #[test]
    fn stale_udev_view_is_recognised_by_superblock_uuid() {
        let recorded = disk("vdb", 252, 16, GIB).xfs("new").build();
        let drive = drive_record("d1", &recorded, DriveState::Ready, ROOT);
        let mut stale = recorded.clone();
        stale.uevent_fs_uuid.clear();
        let other = disk("vdc", 252, 32, GIB).xfs("other").build();

        let pool = vec![other, stale.clone()];
        assert_eq!(awaiting_udev(&drive, &pool), Some(1));
        assert_eq!(awaiting_udev(&drive, &[recorded]), None, "udev already settled");
        assert_eq!(awaiting_udev(&drive, &[stale.clone(), stale.clone()]), None);

        let mut by_serial = drive.clone();
        by_serial.status.serial = "S1".to_string();
        assert_eq!(awaiting_udev(&by_serial, &[stale]), None);
    }

    #[test]
    fn legacy_records_match_by_path() {
        let recorded = disk("sdb", 8, 16, GIB).build();
        let mut drive = drive_record("d1", &recorded, DriveState::Available, ROOT);
        drive.meta.set_label(VERSION_LABEL, LEGACY_VERSION);
        assert_eq!(MatchRule::for_drive(&drive), MatchRule::LegacyPath);

        let resized = disk("sdb", 8, 16, 2 * GIB).build();
        assert!(MatchRule::LegacyPath.matches(&drive, &resized));
        assert!(!MatchRule::Attributes.matches(&drive, &resized));
    }

    #[test]
    fn attribute_rule_compares_flags_and_path() {
        let recorded = disk("sdb", 8, 16, GIB).build();
        let drive = drive_record("d1", &recorded, DriveState::Available, ROOT);
        assert_eq!(MatchRule::for_drive(&drive), MatchRule::Attributes);

        assert!(MatchRule::Attributes.matches(&drive, &recorded));
        let read_only = disk("sdb", 8, 16, GIB).read_only().build();
        assert!(!MatchRule::Attributes.matches(&drive, &read_only));
        let elsewhere = disk("sdc", 8, 32, GIB).build();
        assert!(!MatchRule::Attributes.matches(&drive, &elsewhere));
    }
}
