// SPDX-License-Identifier: GPL-3.0-only

//! Host-backed implementations of the mount and filesystem contracts

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use storage_contracts::{FilesystemOps, MountOps, Result};
use storage_types::{FsInfo, Quota};

use crate::mount::Mounter;
use crate::xfs;

#[async_trait]
impl MountOps for Mounter {
    async fn mount_device(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(self.mount(device, target, fs_type, options, cancel).await?)
    }

    async fn bind_mount(
        &self,
        source: &str,
        target: &str,
        read_only: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(Mounter::bind_mount(self, source, target, read_only, cancel).await?)
    }

    async fn unmount(&self, target: &str, cancel: &CancellationToken) -> Result<()> {
        Ok(Mounter::unmount(self, target, cancel).await?)
    }

    async fn is_mounted(&self, target: &str) -> Result<bool> {
        Ok(Mounter::is_mounted(self, target)?)
    }
}

/// XFS through `mkfs.xfs`, the on-disk superblock and `xfs_quota`
#[derive(Debug, Clone, Copy)]
pub struct XfsFilesystem {
    reflink: bool,
}

impl XfsFilesystem {
    /// `reflink` comes from [`xfs::probe_reflink_support`] at startup.
    pub fn new(reflink: bool) -> Self {
        Self { reflink }
    }

    pub fn reflink(&self) -> bool {
        self.reflink
    }
}

#[async_trait]
impl FilesystemOps for XfsFilesystem {
    async fn format(
        &self,
        device: &str,
        fs_uuid: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::info!(device, fs_uuid, force, reflink = self.reflink, "formatting xfs");
        Ok(xfs::format(device, fs_uuid, force, self.reflink, cancel).await?)
    }

    async fn probe(&self, device: &str, cancel: &CancellationToken) -> Result<FsInfo> {
        Ok(xfs::probe(Path::new(device), cancel).await?)
    }

    async fn set_quota(
        &self,
        device: &str,
        path: &str,
        volume_name: &str,
        quota: Quota,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(xfs::set_quota(device, path, volume_name, quota, cancel).await?)
    }

    async fn get_quota(
        &self,
        device: &str,
        volume_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Quota> {
        Ok(xfs::get_quota(device, volume_name, cancel).await?)
    }
}
