use storage_types::labels::{
    CREATED_BY, CREATED_BY_LABEL, CURRENT_VERSION, DATA_PROTECTION_FINALIZER, DRIVE_NAME_LABEL,
    NODE_LABEL, PATH_LABEL, VERSION_LABEL,
};
use storage_types::{Device, Drive, DriveState, MajorMinor, sanitize_label_value};

pub const NODE: &str = "node-1";
pub const GIB: u64 = 1024 * 1024 * 1024;

pub fn destructive_enabled() -> bool {
    std::env::var("LOCALDRIVE_TESTING_ENABLE_DESTRUCTIVE")
        .ok()
        .as_deref()
        == Some("1")
}

/// Builds device snapshots whose udev record agrees with the typed fields.
#[derive(Debug, Clone)]
pub struct DeviceBuilder {
    device: Device,
}

/// A whole, unformatted, writable disk
pub fn disk(name: &str, major: u32, minor: u32, size: u64) -> DeviceBuilder {
    let mut device = Device {
        name: name.to_string(),
        major_minor: MajorMinor::new(major, minor),
        size,
        total_capacity: size,
        logical_block_size: 512,
        physical_block_size: 4096,
        ..Device::default()
    };
    udev(&mut device, "DEVNAME", &format!("/dev/{name}"));
    udev(&mut device, "DEVTYPE", "disk");
    udev(
        &mut device,
        "DEVPATH",
        &format!("/devices/pci0000:00/0000:00:17.0/ata2/host1/block/{name}"),
    );
    DeviceBuilder { device }
}

fn udev(device: &mut Device, key: &str, value: &str) {
    device.udev_data.insert(key.to_string(), value.to_string());
}

impl DeviceBuilder {
    pub fn wwid(mut self, wwid: &str) -> Self {
        self.device.wwid = wwid.to_string();
        udev(&mut self.device, "ID_WWN", wwid);
        self
    }

    pub fn serial(mut self, serial: &str) -> Self {
        self.device.serial = serial.to_string();
        udev(&mut self.device, "ID_SERIAL_SHORT", serial);
        self
    }

    pub fn model(mut self, vendor: &str, model: &str) -> Self {
        self.device.vendor = vendor.to_string();
        self.device.model = model.to_string();
        udev(&mut self.device, "ID_VENDOR", vendor);
        udev(&mut self.device, "ID_MODEL", model);
        self
    }

    pub fn partition(mut self, number: u32, part_uuid: &str) -> Self {
        self.device.partition_num = number;
        self.device.part_uuid = part_uuid.to_string();
        udev(&mut self.device, "DEVTYPE", "partition");
        udev(&mut self.device, "ID_PART_ENTRY_NUMBER", &number.to_string());
        udev(&mut self.device, "ID_PART_ENTRY_UUID", part_uuid);
        self
    }

    pub fn partition_table(mut self, pt_type: &str, pt_uuid: &str) -> Self {
        self.device.pt_type = pt_type.to_string();
        self.device.pt_uuid = pt_uuid.to_string();
        udev(&mut self.device, "ID_PART_TABLE_TYPE", pt_type);
        udev(&mut self.device, "ID_PART_TABLE_UUID", pt_uuid);
        self
    }

    pub fn xfs(mut self, fs_uuid: &str) -> Self {
        self.device.fs_type = "xfs".to_string();
        self.device.fs_uuid = fs_uuid.to_string();
        self.device.uevent_fs_uuid = fs_uuid.to_string();
        self.device.free_capacity = self.device.size;
        udev(&mut self.device, "ID_FS_TYPE", "xfs");
        udev(&mut self.device, "ID_FS_UUID", fs_uuid);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.device.read_only = true;
        self
    }

    pub fn removable(mut self) -> Self {
        self.device.removable = true;
        self
    }

    pub fn swap(mut self) -> Self {
        self.device.swap_on = true;
        self
    }

    pub fn holders(mut self, holders: &[&str]) -> Self {
        self.device.holders = holders.iter().map(|h| h.to_string()).collect();
        self.device.master = holders
            .iter()
            .find(|h| h.starts_with("dm-") || h.starts_with("md"))
            .map(|h| h.to_string())
            .unwrap_or_default();
        self
    }

    pub fn partitioned(mut self) -> Self {
        self.device.partitioned = true;
        self
    }

    pub fn cdrom(mut self) -> Self {
        self.device.cd_rom = true;
        self
    }

    /// Records an extra mount the host has outside the fake mount table
    pub fn mounted_at(mut self, mount_point: &str) -> Self {
        if self.device.first_mount_point.is_empty() {
            self.device.first_mount_point = mount_point.to_string();
        }
        self.device.mount_points.push(mount_point.to_string());
        self
    }

    pub fn build(self) -> Device {
        self.device
    }
}

/// Drive record carrying `device`'s identity, labelled for [`NODE`].
///
/// Adopted states also get the data-protection finalizer and a mountpoint under
/// `mount_root`.
pub fn drive_record(name: &str, device: &Device, state: DriveState, mount_root: &str) -> Drive {
    let mut drive = Drive::new(name);
    drive.meta.set_label(NODE_LABEL, NODE);
    drive.meta.set_label(DRIVE_NAME_LABEL, device.name.as_str());
    drive.meta.set_label(PATH_LABEL, sanitize_label_value(&device.name));
    drive.meta.set_label(VERSION_LABEL, CURRENT_VERSION);
    drive.meta.set_label(CREATED_BY_LABEL, CREATED_BY);

    let status = &mut drive.status;
    status.path = device.path();
    status.major = device.major_minor.major;
    status.minor = device.major_minor.minor;
    status.wwid = device.wwid.clone();
    status.serial = device.serial.clone();
    status.uevent_serial = device.uevent_serial.clone();
    status.model = device.model.clone();
    status.vendor = device.vendor.clone();
    status.dm_uuid = device.dm_uuid.clone();
    status.md_uuid = device.md_uuid.clone();
    status.pt_uuid = device.pt_uuid.clone();
    status.pt_type = device.pt_type.clone();
    status.part_uuid = device.part_uuid.clone();
    status.partition_num = device.partition_num;
    status.fs_uuid = device.fs_uuid.clone();
    status.uevent_fs_uuid = device.uevent_fs_uuid.clone();
    status.filesystem = device.fs_type.clone();
    status.is_virtual = device.is_virtual;
    status.read_only = device.read_only;
    status.total_capacity = device.total_capacity;
    status.free_capacity = device.total_capacity;
    status.node_name = NODE.to_string();
    status.drive_status = state;

    if state.is_adopted() {
        status.mountpoint = format!("{}/{}", mount_root.trim_end_matches('/'), device.fs_uuid);
        drive.meta.add_finalizer(DATA_PROTECTION_FINALIZER);
    }
    drive
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_udev_record_in_step() {
        let device = disk("sdb", 8, 16, 4 * GIB)
            .wwid("0x5000c500a1b2c3d4")
            .partition(1, "0a1b2c3d-01")
            .xfs("d79dff9e-2884-46f2-8919-dada2eecb12d")
            .build();
        assert_eq!(device.udev_data.get("ID_WWN").map(String::as_str), Some("0x5000c500a1b2c3d4"));
        assert_eq!(device.udev_data.get("ID_PART_ENTRY_NUMBER").map(String::as_str), Some("1"));
        assert_eq!(device.uevent_fs_uuid, device.fs_uuid);
        assert!(device.is_partition());
    }

    #[test]
    fn adopted_records_point_at_uuid_mount() {
        let device = disk("sdb", 8, 16, 4 * GIB).xfs("abc").build();
        let drive = drive_record("abc", &device, DriveState::Ready, "/mnt/root/");
        assert_eq!(drive.status.mountpoint, "/mnt/root/abc");
        assert!(drive.meta.has_finalizer(DATA_PROTECTION_FINALIZER));
        assert_eq!(drive.meta.label(NODE_LABEL), Some(NODE));
    }
}
