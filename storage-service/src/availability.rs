// SPDX-License-Identifier: GPL-3.0-only

//! Decides whether an unclaimed device may be offered as an `Available` drive

use std::fmt;

use storage_types::{Device, MIN_SUPPORTED_DEVICE_SIZE, bytes_to_pretty};

use crate::config::AvailabilityMountPolicy;

/// First failing availability check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unavailable {
    TooSmall(u64),
    ReadOnly,
    Hidden,
    Removable,
    Swap,
    CdRom,
    Master(String),
    Holders(Vec<String>),
    Mounted(String),
    Partitioned,
}

impl Unavailable {
    /// Condition reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TooSmall(_) => "TooSmall",
            Self::ReadOnly => "ReadOnly",
            Self::Hidden => "Hidden",
            Self::Removable => "Removable",
            Self::Swap => "SwapOn",
            Self::CdRom => "CdRom",
            Self::Master(_) => "HasMaster",
            Self::Holders(_) => "HasHolders",
            Self::Mounted(_) => "Mounted",
            Self::Partitioned => "Partitioned",
        }
    }
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall(size) => write!(
                f,
                "size {} is below the supported minimum {}",
                bytes_to_pretty(size, true),
                bytes_to_pretty(&MIN_SUPPORTED_DEVICE_SIZE, false)
            ),
            Self::ReadOnly => f.write_str("device is read-only"),
            Self::Hidden => f.write_str("device is hidden"),
            Self::Removable => f.write_str("device is removable"),
            Self::Swap => f.write_str("device is used as swap"),
            Self::CdRom => f.write_str("device is a CD-ROM drive"),
            Self::Master(master) => write!(f, "device is held by {master}"),
            Self::Holders(holders) => write!(f, "device has holders {}", holders.join(",")),
            Self::Mounted(mount_point) => write!(f, "device is mounted at {mount_point}"),
            Self::Partitioned => f.write_str("device has partitions"),
        }
    }
}

pub fn check(
    device: &Device,
    mount_root: &str,
    policy: AvailabilityMountPolicy,
) -> Result<(), Unavailable> {
    if device.size < MIN_SUPPORTED_DEVICE_SIZE {
        return Err(Unavailable::TooSmall(device.size));
    }
    if device.read_only {
        return Err(Unavailable::ReadOnly);
    }
    if device.hidden {
        return Err(Unavailable::Hidden);
    }
    if device.removable {
        return Err(Unavailable::Removable);
    }
    if device.swap_on {
        return Err(Unavailable::Swap);
    }
    if device.cd_rom {
        return Err(Unavailable::CdRom);
    }
    if !device.master.is_empty() {
        return Err(Unavailable::Master(device.master.clone()));
    }
    if !device.holders.is_empty() {
        return Err(Unavailable::Holders(device.holders.clone()));
    }
    if let Some(mount_point) = disqualifying_mount(device, mount_root, policy) {
        return Err(Unavailable::Mounted(mount_point.to_string()));
    }
    if device.partitioned && !device.is_partition() {
        return Err(Unavailable::Partitioned);
    }
    Ok(())
}

fn disqualifying_mount<'a>(
    device: &'a Device,
    mount_root: &str,
    policy: AvailabilityMountPolicy,
) -> Option<&'a str> {
    let prefix = format!("{}/", mount_root.trim_end_matches('/'));
    device
        .mount_points
        .iter()
        .find(|mount_point| match policy {
            AvailabilityMountPolicy::NoMounts => true,
            AvailabilityMountPolicy::OutsideMountRoot => !mount_point.starts_with(&prefix),
        })
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use storage_testing::fixtures::{GIB, disk};

    use super::*;

    const ROOT: &str = "/var/lib/localdrive/mnt";
    const POLICY: AvailabilityMountPolicy = AvailabilityMountPolicy::OutsideMountRoot;

    #[test]
    fn minimum_size_boundary() {
        let exact = disk("sdb", 8, 16, MIN_SUPPORTED_DEVICE_SIZE).build();
        assert_eq!(check(&exact, ROOT, POLICY), Ok(()));

        let short = disk("sdb", 8, 16, MIN_SUPPORTED_DEVICE_SIZE - 1).build();
        let err = check(&short, ROOT, POLICY).expect_err("too small");
        assert_eq!(err, Unavailable::TooSmall(MIN_SUPPORTED_DEVICE_SIZE - 1));
        assert_eq!(err.reason(), "TooSmall");
    }

    #[test]
    fn reports_first_failing_check() {
        let device = disk("sdb", 8, 16, GIB).read_only().swap().build();
        assert_eq!(check(&device, ROOT, POLICY), Err(Unavailable::ReadOnly));

        let held = disk("sdb", 8, 16, GIB).holders(&["dm-0"]).build();
        let err = check(&held, ROOT, POLICY).expect_err("held");
        assert_eq!(err.to_string(), "device is held by dm-0");

        let cdrom = disk("sr0", 11, 0, GIB).cdrom().build();
        assert_eq!(check(&cdrom, ROOT, POLICY), Err(Unavailable::CdRom));
    }

    #[test]
    fn mount_policy() {
        let inside = disk("sdb", 8, 16, GIB).mounted_at("/var/lib/localdrive/mnt/u1").build();
        assert_eq!(check(&inside, ROOT, POLICY), Ok(()));
        assert!(matches!(
            check(&inside, ROOT, AvailabilityMountPolicy::NoMounts),
            Err(Unavailable::Mounted(_))
        ));

        let outside = disk("sdb", 8, 16, GIB).mounted_at("/home").build();
        assert_eq!(
            check(&outside, ROOT, POLICY),
            Err(Unavailable::Mounted("/home".to_string()))
        );

        let sibling = disk("sdb", 8, 16, GIB).mounted_at("/var/lib/localdrive/mnt2").build();
        assert!(check(&sibling, ROOT, POLICY).is_err());
    }

    #[test]
    fn partitioned_whole_disks_are_unavailable() {
        let whole = disk("sda", 8, 0, GIB).partitioned().build();
        assert_eq!(check(&whole, ROOT, POLICY), Err(Unavailable::Partitioned));

        let partition = disk("sda1", 8, 1, GIB).partition(1, "p1").build();
        assert_eq!(check(&partition, ROOT, POLICY), Ok(()));
    }
}
