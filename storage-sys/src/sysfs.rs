// SPDX-License-Identifier: GPL-3.0-only

//! Block-device attributes from `/sys`, plus swap areas and CD-ROM drives from `/proc`

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use storage_types::MajorMinor;

use crate::{Result, SysError};

/// Sector size used by `/sys/class/block/<name>/size`
const SECTOR_SIZE: u64 = 512;

/// Read-only view of a sysfs tree rooted at `root` (normally `/sys`)
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn class_block(&self, name: &str) -> PathBuf {
        self.root.join("class/block").join(name)
    }

    /// Kernel name from `dev/block/<major:minor>/uevent`
    pub fn device_name(&self, major_minor: MajorMinor) -> Result<String> {
        let path = self.root.join(format!("dev/block/{major_minor}/uevent"));
        let uevent = fs::read_to_string(&path)?;
        for line in uevent.lines() {
            if let Some(name) = line.strip_prefix("DEVNAME=") {
                let name = name.trim();
                if name.is_empty() {
                    return Err(SysError::Parse(format!(
                        "{} contains an empty DEVNAME",
                        path.display()
                    )));
                }
                return Ok(name.to_string());
            }
        }
        Err(SysError::Parse(format!("{} has no DEVNAME", path.display())))
    }

    /// Missing on most real devices; absent means not hidden.
    pub fn hidden(&self, name: &str) -> bool {
        read_first_line_opt(&self.class_block(name).join("hidden")).is_some_and(|v| v == "1")
    }

    pub fn removable(&self, name: &str) -> Result<bool> {
        flag(&self.class_block(name).join("removable"))
    }

    pub fn read_only(&self, name: &str) -> Result<bool> {
        flag(&self.class_block(name).join("ro"))
    }

    /// Size in bytes
    pub fn size(&self, name: &str) -> Result<u64> {
        let value = read_first_line(&self.class_block(name).join("size"))?;
        if value.is_empty() {
            return Ok(0);
        }
        let sectors: u64 = value
            .parse()
            .map_err(|e| SysError::Parse(format!("invalid size '{value}' for {name}: {e}")))?;
        Ok(sectors.saturating_mul(SECTOR_SIZE))
    }

    /// Partitions of a whole disk: entries under `block/<name>/` prefixed by the name
    pub fn partitions(&self, name: &str) -> Result<Vec<String>> {
        Ok(read_dir_names(&self.root.join("block").join(name))?
            .into_iter()
            .filter(|entry| entry.starts_with(name))
            .collect())
    }

    pub fn holders(&self, name: &str) -> Result<Vec<String>> {
        match read_dir_names(&self.class_block(name).join("holders")) {
            Err(SysError::Io(err)) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            other => other,
        }
    }

    pub fn dm_name(&self, name: &str) -> String {
        read_first_line_opt(&self.class_block(name).join("dm/name")).unwrap_or_default()
    }

    /// `device/serial` exposed by some transports (NVMe, virtio)
    pub fn serial(&self, name: &str) -> String {
        read_first_line_opt(&self.class_block(name).join("device/serial")).unwrap_or_default()
    }

    pub fn logical_block_size(&self, name: &str) -> u64 {
        self.block_size(name, "queue/logical_block_size")
    }

    pub fn physical_block_size(&self, name: &str) -> u64 {
        self.block_size(name, "queue/physical_block_size")
    }

    fn block_size(&self, name: &str, attribute: &str) -> u64 {
        read_first_line_opt(&self.class_block(name).join(attribute))
            .and_then(|v| v.parse().ok())
            .unwrap_or(SECTOR_SIZE)
    }
}

/// Device-mapper or md holder that owns this device, if any
pub fn master_of(holders: &[String]) -> String {
    holders
        .iter()
        .find(|holder| holder.starts_with("dm-") || holder.starts_with("md"))
        .cloned()
        .unwrap_or_default()
}

/// Filenames listed in a `/proc/swaps` table
pub fn parse_swaps(input: &str) -> Vec<String> {
    input
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(|filename| filename.replace("\\040", " "))
        .collect()
}

/// Active swap areas resolved to the block devices that back them.
///
/// Swap files and stale entries resolve to no device number.
pub fn read_swap_devices(swaps_path: &Path) -> Result<Vec<SwapArea>> {
    let input = match fs::read_to_string(swaps_path) {
        Ok(input) => input,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    Ok(parse_swaps(&input)
        .into_iter()
        .map(|filename| {
            let major_minor = nix::sys::stat::stat(filename.as_str()).ok().and_then(|st| {
                let is_block = st.st_mode & libc::S_IFMT == libc::S_IFBLK;
                is_block.then(|| {
                    MajorMinor::new(
                        nix::sys::stat::major(st.st_rdev) as u32,
                        nix::sys::stat::minor(st.st_rdev) as u32,
                    )
                })
            });
            SwapArea {
                filename,
                major_minor,
            }
        })
        .collect())
}

/// Drive names from the `drive name:` row of `/proc/sys/dev/cdrom/info`
pub fn parse_cdroms(input: &str) -> Vec<String> {
    input
        .lines()
        .find_map(|line| line.split_once("drive name:"))
        .map(|(_, names)| names.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

pub fn read_cdroms(info_path: &Path) -> Result<Vec<String>> {
    match fs::read_to_string(info_path) {
        Ok(input) => Ok(parse_cdroms(&input)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapArea {
    pub filename: String,
    pub major_minor: Option<MajorMinor>,
}

impl SwapArea {
    pub fn backs(&self, name: &str, major_minor: MajorMinor) -> bool {
        self.major_minor == Some(major_minor) || self.filename == format!("/dev/{name}")
    }
}

fn read_first_line(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path)?;
    Ok(content.lines().next().unwrap_or_default().trim().to_string())
}

fn read_first_line_opt(path: &Path) -> Option<String> {
    read_first_line(path).ok()
}

fn flag(path: &Path) -> Result<bool> {
    let value = read_first_line(path)?;
    Ok(!value.is_empty() && value != "0")
}

fn read_dir_names(path: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(path)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}
