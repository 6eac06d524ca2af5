// SPDX-License-Identifier: GPL-3.0-only

//! Block-device discovery
//!
//! Walks the udev database, then fills in `/sys`, `/proc` and mount-table state and reads
//! the XFS superblock of each device. A device that cannot be read is logged and skipped.

use std::collections::BTreeMap;
use std::path::PathBuf;

use storage_contracts::DeviceProbe;
use storage_types::{Device, MajorMinor, MountTable};

use crate::mountinfo::read_mount_table;
use crate::sysfs::{SwapArea, Sysfs, master_of, read_cdroms, read_swap_devices};
use crate::udev::{self, list_block_devices, normalize_uuid, read_udev_data};
use crate::xfs::read_superblock;
use crate::{Result, SysError};

/// Host locations consulted while probing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub udev_data_dir: PathBuf,
    pub sys_root: PathBuf,
    pub proc_root: PathBuf,
    pub mountinfo: PathBuf,
    pub dev_root: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            udev_data_dir: PathBuf::from("/run/udev/data"),
            sys_root: PathBuf::from("/sys"),
            proc_root: PathBuf::from("/proc"),
            mountinfo: PathBuf::from("/proc/1/mountinfo"),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

pub fn is_loop_device(name: &str) -> bool {
    name.starts_with("loop")
}

/// Host-wide state read once per probe batch
struct BatchState {
    mounts: MountTable,
    swaps: Vec<SwapArea>,
    cdroms: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DeviceProber {
    paths: HostPaths,
    sysfs: Sysfs,
    allow_loop: bool,
}

impl DeviceProber {
    pub fn new(paths: HostPaths, allow_loop: bool) -> Self {
        let sysfs = Sysfs::new(paths.sys_root.clone());
        Self {
            paths,
            sysfs,
            allow_loop,
        }
    }

    pub fn paths(&self) -> &HostPaths {
        &self.paths
    }

    fn batch_state(&self) -> Result<BatchState> {
        Ok(BatchState {
            mounts: read_mount_table(&self.paths.mountinfo)?,
            swaps: read_swap_devices(&self.paths.proc_root.join("swaps"))?,
            cdroms: read_cdroms(&self.paths.proc_root.join("sys/dev/cdrom/info"))?,
        })
    }

    /// Probes every block device; per-device failures never fail the batch.
    pub fn probe(&self) -> Result<Vec<Device>> {
        let state = self.batch_state()?;
        let mut devices = Vec::new();

        for major_minor in list_block_devices(&self.paths.udev_data_dir)? {
            let name = match self.sysfs.device_name(major_minor) {
                Ok(name) => name,
                Err(err) => {
                    tracing::debug!(%major_minor, "unable to resolve device name: {err}");
                    continue;
                }
            };
            if !self.allow_loop && is_loop_device(&name) {
                tracing::trace!(device = %name, "ignoring loop device");
                continue;
            }

            match self.probe_one(&name, major_minor, &state) {
                Ok(device) => devices.push(device),
                Err(err) => tracing::debug!(device = %name, "skipping device: {err}"),
            }
        }

        Ok(devices)
    }

    fn probe_one(&self, name: &str, major_minor: MajorMinor, state: &BatchState) -> Result<Device> {
        let udev_data = read_udev_data(&self.paths.udev_data_dir, major_minor)?;
        let mut device = device_from_udev(name, major_minor, udev_data)?;

        device.hidden = self.sysfs.hidden(name);
        device.removable = self.sysfs.removable(name)?;
        device.read_only = self.sysfs.read_only(name)?;
        device.size = self.sysfs.size(name)?;
        device.total_capacity = device.size;
        device.serial = self.sysfs.serial(name);
        device.logical_block_size = self.sysfs.logical_block_size(name);
        device.physical_block_size = self.sysfs.physical_block_size(name);
        if device.dm_name.is_empty() {
            device.dm_name = self.sysfs.dm_name(name);
        }

        if !device.hidden {
            if !device.is_partition() {
                device.partitioned = !self.sysfs.partitions(name)?.is_empty();
            }
            device.holders = self.sysfs.holders(name)?;
            device.master = master_of(&device.holders);
            device.swap_on = state.swaps.iter().any(|swap| swap.backs(name, major_minor));
            device.cd_rom = state.cdroms.iter().any(|cdrom| cdrom == name);
        }

        if let Some(mounts) = state.mounts.get(&major_minor) {
            device.mount_points = mounts.iter().map(|m| m.mount_point.clone()).collect();
            if let Some(first) = mounts.first() {
                device.first_mount_point = first.mount_point.clone();
                device.first_mount_options = first.mount_options.clone();
            }
        }

        if !device.hidden && !device.cd_rom {
            self.probe_filesystem(&mut device)?;
        }

        Ok(device)
    }

    /// Reads the XFS superblock when udev reports XFS or nothing.
    ///
    /// udev may leave the type empty for XFS devices, so an empty type is probed too.
    fn probe_filesystem(&self, device: &mut Device) -> Result<()> {
        if !(device.fs_type.is_empty() || device.fs_type.eq_ignore_ascii_case("xfs")) {
            return Ok(());
        }

        match read_superblock(&self.paths.dev_root.join(&device.name)) {
            Ok(sb) => {
                let info = sb.fs_info();
                if device.fs_type.is_empty() {
                    device.fs_type = info.fs_type;
                }
                device.fs_uuid = info.fs_uuid;
                device.total_capacity = info.total_bytes;
                device.free_capacity = info.free_bytes;
                Ok(())
            }
            Err(_) if device.size == 0 => Ok(()),
            Err(SysError::NoFilesystem(_)) => Ok(()),
            Err(SysError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Builds the identity part of a snapshot from a udev record
pub fn device_from_udev(
    name: &str,
    major_minor: MajorMinor,
    udev_data: BTreeMap<String, String>,
) -> Result<Device> {
    let get = |key: &str| udev_data.get(key).cloned().unwrap_or_default();

    let partition_num = match udev_data.get(udev::ID_PART_ENTRY_NUMBER) {
        Some(value) if !value.is_empty() => value.parse::<u32>().map_err(|e| {
            SysError::Parse(format!("invalid partition number '{value}' for {name}: {e}"))
        })?,
        _ => 0,
    };

    let md_uuid = get(udev::MD_UUID);
    Ok(Device {
        name: name.to_string(),
        major_minor,
        wwid: get(udev::ID_WWN),
        serial_long: get(udev::ID_SERIAL),
        uevent_serial: get(udev::ID_SERIAL_SHORT),
        model: get(udev::ID_MODEL),
        vendor: get(udev::ID_VENDOR),
        dm_name: get(udev::DM_NAME),
        dm_uuid: get(udev::DM_UUID),
        md_uuid: if md_uuid.is_empty() {
            md_uuid
        } else {
            normalize_uuid(&md_uuid)
        },
        pt_uuid: get(udev::ID_PART_TABLE_UUID),
        pt_type: get(udev::ID_PART_TABLE_TYPE),
        part_uuid: get(udev::ID_PART_ENTRY_UUID),
        partition_num,
        uevent_fs_uuid: get(udev::ID_FS_UUID),
        fs_type: get(udev::ID_FS_TYPE),
        pci_path: get(udev::ID_PATH),
        is_virtual: get(udev::DEVPATH).contains("/virtual/"),
        udev_data,
        ..Device::default()
    })
}

impl DeviceProbe for DeviceProber {
    fn probe_devices(&self) -> storage_contracts::Result<Vec<Device>> {
        Ok(self.probe()?)
    }

    fn read_udev_data(
        &self,
        major_minor: MajorMinor,
    ) -> storage_contracts::Result<BTreeMap<String, String>> {
        Ok(read_udev_data(&self.paths.udev_data_dir, major_minor)?)
    }
}
