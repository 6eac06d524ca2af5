// SPDX-License-Identifier: GPL-3.0-only

//! udev database reader (`/run/udev/data/b<major>:<minor>`)

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use storage_types::MajorMinor;

use crate::Result;

pub const ID_WWN: &str = "ID_WWN";
pub const ID_MODEL: &str = "ID_MODEL";
pub const ID_VENDOR: &str = "ID_VENDOR";
pub const ID_SERIAL: &str = "ID_SERIAL";
pub const ID_SERIAL_SHORT: &str = "ID_SERIAL_SHORT";
pub const DM_NAME: &str = "DM_NAME";
pub const DM_UUID: &str = "DM_UUID";
pub const MD_UUID: &str = "MD_UUID";
pub const ID_PART_TABLE_UUID: &str = "ID_PART_TABLE_UUID";
pub const ID_PART_TABLE_TYPE: &str = "ID_PART_TABLE_TYPE";
pub const ID_PART_ENTRY_UUID: &str = "ID_PART_ENTRY_UUID";
pub const ID_PART_ENTRY_NUMBER: &str = "ID_PART_ENTRY_NUMBER";
pub const ID_FS_UUID: &str = "ID_FS_UUID";
pub const ID_FS_TYPE: &str = "ID_FS_TYPE";
pub const ID_PATH: &str = "ID_PATH";
pub const DEVPATH: &str = "DEVPATH";

/// Parses udev properties.
///
/// The database stores properties as `E:KEY=VALUE`; other record types (`S:`, `I:`, `G:`,
/// ...) are skipped. Lines without a type prefix are taken as plain properties.
pub fn parse_udev_data(input: &str) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();

    for line in input.lines() {
        let line = line.trim_end();
        let entry = match line.split_once(':') {
            Some(("E", rest)) => rest,
            Some((prefix, _)) if prefix.len() == 1 => continue,
            _ => line,
        };

        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                properties.insert(key.to_string(), value.trim().to_string());
            }
            None if !entry.is_empty() => {
                properties.insert(entry.to_string(), String::new());
            }
            _ => {}
        }
    }

    properties
}

pub fn udev_data_path(udev_data_dir: &Path, major_minor: MajorMinor) -> std::path::PathBuf {
    udev_data_dir.join(format!("b{major_minor}"))
}

pub fn read_udev_data(udev_data_dir: &Path, major_minor: MajorMinor) -> Result<BTreeMap<String, String>> {
    let input = fs::read_to_string(udev_data_path(udev_data_dir, major_minor))?;
    Ok(parse_udev_data(&input))
}

/// Block-device entries of the udev database, in directory order sorted by device number
pub fn list_block_devices(udev_data_dir: &Path) -> Result<Vec<MajorMinor>> {
    let mut devices = Vec::new();
    for entry in fs::read_dir(udev_data_dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        let Some(number) = name.strip_prefix('b') else {
            continue;
        };
        match number.parse::<MajorMinor>() {
            Ok(major_minor) => devices.push(major_minor),
            Err(err) => tracing::debug!("skipping udev entry {name}: {err}"),
        }
    }
    devices.sort();
    Ok(devices)
}

/// Canonical 8-4-4-4-12 form of an md/dm UUID (`a1b2c3d4:e5f6a7b8:...` → hyphenated)
pub fn normalize_uuid(value: &str) -> String {
    let hex: String = value
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_ascii_lowercase();
    if hex.len() != 32 {
        return value.to_string();
    }
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDB1: &str = "\
S:disk/by-id/wwn-0x5000c500a1b2c3d4-part1
S:disk/by-partuuid/0a1b2c3d-01
I:1638472838
E:ID_WWN=0x5000c500a1b2c3d4
E:ID_MODEL=ST2000DM008
E:ID_SERIAL=ST2000DM008_ZFL1ABCD
E:ID_SERIAL_SHORT=ZFL1ABCD
E:ID_PART_ENTRY_NUMBER=1
E:ID_PART_ENTRY_UUID=0A1B2C3D-01
E:ID_FS_TYPE=xfs
E:ID_FS_UUID=d79dff9e-2884-46f2-8919-dada2eecb12d
E:ID_PATH=pci-0000:00:17.0-ata-2
G:systemd
";

    #[test]
    fn keeps_only_properties() {
        let data = parse_udev_data(SDB1);
        assert_eq!(data.get(ID_WWN).map(String::as_str), Some("0x5000c500a1b2c3d4"));
        assert_eq!(data.get(ID_PART_ENTRY_NUMBER).map(String::as_str), Some("1"));
        assert_eq!(data.get(ID_PATH).map(String::as_str), Some("pci-0000:00:17.0-ata-2"));
        assert!(!data.contains_key("disk/by-id/wwn-0x5000c500a1b2c3d4-part1"));
        assert!(!data.keys().any(|k| k.starts_with("I") && k.len() == 1));
        assert_eq!(data.len(), 9);
    }

    #[test]
    fn accepts_plain_key_value_lines() {
        let data = parse_udev_data("DEVNAME=sdb\nDEVTYPE=disk\nFLAG\n");
        assert_eq!(data.get("DEVNAME").map(String::as_str), Some("sdb"));
        assert_eq!(data.get("FLAG").map(String::as_str), Some(""));
    }

    #[test]
    fn lists_block_entries_from_database() {
        let dir = tempfile::tempdir().expect("temp dir");
        for name in ["b8:16", "b8:0", "c4:64", "n3", "b259:1"] {
            fs::write(dir.path().join(name), "E:ID_FS_TYPE=\n").expect("write entry");
        }
        let devices = list_block_devices(dir.path()).expect("list");
        assert_eq!(
            devices,
            vec![MajorMinor::new(8, 0), MajorMinor::new(8, 16), MajorMinor::new(259, 1)]
        );

        let data = read_udev_data(dir.path(), MajorMinor::new(8, 16)).expect("read");
        assert_eq!(data.get(ID_FS_TYPE).map(String::as_str), Some(""));
    }

    #[test]
    fn normalizes_md_uuids() {
        assert_eq!(
            normalize_uuid("a1b2c3d4:e5f6a7b8:c9d0e1f2:a3b4c5d6"),
            "a1b2c3d4-e5f6-a7b8-c9d0-e1f2a3b4c5d6"
        );
        assert_eq!(normalize_uuid("short"), "short");
    }
}
