// SPDX-License-Identifier: GPL-3.0-only

//! Kernel mount-info parsing
//!
//! Line format (see proc(5)):
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
//! ```

use std::fs;
use std::path::Path;

use storage_types::{MajorMinor, MountInfo, MountTable};

use crate::{Result, SysError};

const MIN_FIELDS: usize = 8;

/// Reads and parses a mount-info file grouped by device
pub fn read_mount_table(path: &Path) -> Result<MountTable> {
    let input = fs::read_to_string(path)?;
    parse_mount_info(&input)
}

/// Reads and parses a mount-info file in kernel order
pub fn read_mount_entries(path: &Path) -> Result<Vec<MountInfo>> {
    let input = fs::read_to_string(path)?;
    parse_mount_entries(&input)
}

pub fn parse_mount_info(input: &str) -> Result<MountTable> {
    Ok(group_by_device(parse_mount_entries(input)?))
}

pub fn parse_mount_entries(input: &str) -> Result<Vec<MountInfo>> {
    input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect()
}

pub fn group_by_device(entries: Vec<MountInfo>) -> MountTable {
    let mut table = MountTable::new();
    for entry in entries {
        table.entry(entry.major_minor).or_default().push(entry);
    }
    table
}

fn invalid(line: &str, reason: &str) -> SysError {
    SysError::Parse(format!("invalid mountinfo line '{line}': {reason}"))
}

fn parse_line(line: &str) -> Result<MountInfo> {
    let field_count = line.split_whitespace().filter(|f| *f != "-").count();
    if field_count < MIN_FIELDS {
        return Err(invalid(line, "fewer than eight fields"));
    }

    let (left, right) = line
        .split_once(" - ")
        .ok_or_else(|| invalid(line, "missing separator"))?;

    let left: Vec<&str> = left.split_whitespace().collect();
    let right: Vec<&str> = right.split_whitespace().collect();
    if left.len() < 6 || right.len() < 2 {
        return Err(invalid(line, "fewer than eight fields"));
    }

    let mount_id = left[0]
        .parse()
        .map_err(|_| invalid(line, "mount id is not a number"))?;
    let parent_id = left[1]
        .parse()
        .map_err(|_| invalid(line, "parent id is not a number"))?;
    let major_minor: MajorMinor = left[2]
        .parse()
        .map_err(|_| invalid(line, "invalid major:minor"))?;

    let (fs_type, fs_subtype) = match right[0].split_once('.') {
        Some((fs_type, subtype)) => (fs_type.to_string(), subtype.to_string()),
        None => (right[0].to_string(), String::new()),
    };

    Ok(MountInfo {
        mount_id,
        parent_id,
        major_minor,
        root: unescape_mount_field(left[3]),
        mount_point: unescape_mount_field(left[4]),
        mount_options: sorted_options(left[5]),
        optional_fields: left[6..].iter().map(|f| f.to_string()).collect(),
        fs_type,
        fs_subtype,
        source: unescape_mount_field(right[1]),
        super_options: right.get(2).map(|o| sorted_options(o)).unwrap_or_default(),
    })
}

fn sorted_options(field: &str) -> Vec<String> {
    let mut options: Vec<String> = field
        .split(',')
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect();
    options.sort();
    options
}

/// Renders entries back into mount-info text
pub fn serialize_entries<'a>(entries: impl IntoIterator<Item = &'a MountInfo>) -> String {
    let mut out = String::new();
    for entry in entries {
        let mut fields = vec![
            entry.mount_id.to_string(),
            entry.parent_id.to_string(),
            entry.major_minor.to_string(),
            escape_mount_field(&entry.root),
            escape_mount_field(&entry.mount_point),
            entry.mount_options.join(","),
        ];
        fields.extend(entry.optional_fields.iter().cloned());
        fields.push("-".to_string());
        fields.push(entry.full_fs_type());
        fields.push(escape_mount_field(&entry.source));
        if !entry.super_options.is_empty() {
            fields.push(entry.super_options.join(","));
        }
        out.push_str(&fields.join(" "));
        out.push('\n');
    }
    out
}

pub fn serialize_mount_table(table: &MountTable) -> String {
    serialize_entries(table.values().flatten())
}

fn unescape_mount_field(value: &str) -> String {
    let mut output = Vec::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1..index + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let octal = &value[index + 1..index + 4];
            if let Ok(num) = u8::from_str_radix(octal, 8) {
                output.push(num);
                index += 4;
                continue;
            }
        }

        output.push(bytes[index]);
        index += 1;
    }

    String::from_utf8_lossy(&output).into_owned()
}

fn escape_mount_field(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ' ' | '\t' | '\n' | '\\' => output.push_str(&format!("\\{:03o}", c as u32)),
            _ => output.push(c),
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:2 / / rw,relatime shared:1 - ext4 /dev/sda2 rw,errors=remount-ro
41 22 8:16 / /var/lib/localdrive/mnt/d79dff9e rw,noatime,relatime shared:30 - xfs /dev/sdb rw,attr2,inode64,prjquota
42 22 8:16 /vol-1 /var/lib/kubelet/pods/x/volumes/vol-1 rw,relatime - xfs /dev/sdb rw,prjquota
43 22 0:45 / /run/user/1000/doc rw,nosuid,nodev,relatime shared:120 - fuse.portal portal rw,user_id=1000
44 22 8:33 / /mnt/with\\040space ro - vfat /dev/sdc1 rw
";

    #[test]
    fn groups_records_by_device_in_read_order() {
        let table = parse_mount_info(SAMPLE).expect("parse mountinfo");
        let sdb = table.get(&MajorMinor::new(8, 16)).expect("sdb mounts");
        let points: Vec<_> = sdb.iter().map(|m| m.mount_point.as_str()).collect();
        assert_eq!(
            points,
            vec![
                "/var/lib/localdrive/mnt/d79dff9e",
                "/var/lib/kubelet/pods/x/volumes/vol-1"
            ]
        );
        assert_eq!(sdb[0].mount_options, vec!["noatime", "relatime", "rw"]);
        assert_eq!(sdb[0].optional_fields, vec!["shared:30"]);
        assert_eq!(sdb[0].super_options, vec!["attr2", "inode64", "prjquota", "rw"]);
        assert!(sdb[0].has_option("prjquota"));
        assert_eq!(sdb[1].root, "/vol-1");
    }

    #[test]
    fn splits_fs_subtype_and_unescapes_paths() {
        let table = parse_mount_info(SAMPLE).expect("parse mountinfo");
        let portal = &table[&MajorMinor::new(0, 45)][0];
        assert_eq!(portal.fs_type, "fuse");
        assert_eq!(portal.fs_subtype, "portal");
        assert_eq!(portal.full_fs_type(), "fuse.portal");

        let spaced = &table[&MajorMinor::new(8, 33)][0];
        assert_eq!(spaced.mount_point, "/mnt/with space");
    }

    #[test]
    fn rejects_short_lines() {
        let err = parse_mount_info("22 1 8:2 / / - ext4\n").expect_err("short line");
        assert!(matches!(err, SysError::Parse(_)));

        let err = parse_mount_info("22 1 8:2 / / rw ext4 /dev/sda2 rw\n").expect_err("no separator");
        assert!(matches!(err, SysError::Parse(_)));
    }

    #[test]
    fn serialized_table_parses_back_unchanged() {
        let table = parse_mount_info(SAMPLE).expect("parse mountinfo");
        let text = serialize_mount_table(&table);
        let reparsed = parse_mount_info(&text).expect("reparse mountinfo");
        assert_eq!(reparsed, table);
    }
}
