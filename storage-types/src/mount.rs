// SPDX-License-Identifier: GPL-3.0-only

//! Mount table records

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::MajorMinor;

/// One line of the kernel mount-info table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountInfo {
    pub mount_id: u32,
    pub parent_id: u32,
    pub major_minor: MajorMinor,
    /// Root of the mount within the filesystem
    pub root: String,
    pub mount_point: String,
    /// Per-mount options, sorted lexicographically
    pub mount_options: Vec<String>,
    /// Optional fields (shared:N, master:N, ...) in kernel order
    pub optional_fields: Vec<String>,
    pub fs_type: String,
    pub fs_subtype: String,
    pub source: String,
    /// Per-superblock options, sorted lexicographically
    pub super_options: Vec<String>,
}

impl MountInfo {
    /// Filesystem type including the subtype suffix, as the kernel prints it
    pub fn full_fs_type(&self) -> String {
        if self.fs_subtype.is_empty() {
            self.fs_type.clone()
        } else {
            format!("{}.{}", self.fs_type, self.fs_subtype)
        }
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.mount_options.iter().any(|o| o == option)
            || self.super_options.iter().any(|o| o == option)
    }
}

/// Mount records grouped by backing device; per-device order is the order read
pub type MountTable = BTreeMap<MajorMinor, Vec<MountInfo>>;
