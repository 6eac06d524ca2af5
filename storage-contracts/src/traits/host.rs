// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use storage_types::{Device, FsInfo, MajorMinor, Quota};

use crate::Result;

/// Enumerates block devices on this node.
///
/// Probing is synchronous within its caller; implementations skip devices they fail to
/// read instead of failing the batch.
pub trait DeviceProbe: Send + Sync {
    fn probe_devices(&self) -> Result<Vec<Device>>;

    /// Current udev key/value record for one device
    fn read_udev_data(&self, major_minor: MajorMinor) -> Result<BTreeMap<String, String>>;
}

#[async_trait]
pub trait MountOps: Send + Sync {
    /// Mounts `device` at `target`, creating the target directory. No-op when already mounted there.
    async fn mount_device(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Recursive bind mount of `source` onto `target`. No-op when `target` is already a mount point.
    async fn bind_mount(
        &self,
        source: &str,
        target: &str,
        read_only: bool,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Unmounts `target` when it is a mount point, otherwise does nothing.
    async fn unmount(&self, target: &str, cancel: &CancellationToken) -> Result<()>;

    async fn is_mounted(&self, target: &str) -> Result<bool>;
}

#[async_trait]
pub trait FilesystemOps: Send + Sync {
    async fn format(
        &self,
        device: &str,
        fs_uuid: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn probe(&self, device: &str, cancel: &CancellationToken) -> Result<FsInfo>;

    async fn set_quota(
        &self,
        device: &str,
        path: &str,
        volume_name: &str,
        quota: Quota,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn get_quota(
        &self,
        device: &str,
        volume_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Quota>;
}
