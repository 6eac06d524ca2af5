// SPDX-License-Identifier: GPL-3.0-only

//! XFS formatting, superblock probing and project quotas

pub mod mkfs;
pub mod quota;
pub mod superblock;

pub use mkfs::{FS_LABEL, format, mkfs_args, probe_reflink_support};
pub use quota::{get_quota, parse_quota_report, project_id, set_quota};
pub use superblock::{
    Superblock, XFS_MAGIC, encode_superblock, parse_superblock, probe, read_superblock,
};
