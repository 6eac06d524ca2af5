// SPDX-License-Identifier: GPL-3.0-only

//! Volume mounts and capacity accounting on adopted drives

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use storage_contracts::{
    AgentError, DriveRegistry, ErrorKind, FilesystemOps, MountOps, Result,
};
use storage_types::labels::volume_finalizer;
use storage_types::{Drive, DriveState, Quota};

use crate::retry::update_with_retry;

pub struct VolumeCoordinator {
    mounter: Arc<dyn MountOps>,
    filesystem: Arc<dyn FilesystemOps>,
    drives: Arc<DriveRegistry>,
}

impl VolumeCoordinator {
    pub fn new(
        mounter: Arc<dyn MountOps>,
        filesystem: Arc<dyn FilesystemOps>,
        drives: Arc<DriveRegistry>,
    ) -> Self {
        Self {
            mounter,
            filesystem,
            drives,
        }
    }

    /// Creates `<drive mountpoint>/<volume>`, bind-mounts it on `staging_path` and caps it
    /// with a project quota of `total_capacity`.
    pub async fn stage(
        &self,
        drive: &Drive,
        volume_name: &str,
        staging_path: &str,
        total_capacity: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mountpoint = drive.status.mountpoint.trim_end_matches('/');
        if mountpoint.is_empty() {
            return Err(AgentError::new(
                ErrorKind::MountFailure,
                format!("drive {} is not mounted", drive.meta.name),
            ));
        }
        let source = format!("{mountpoint}/{volume_name}");

        create_dir(&source).await?;
        create_dir(staging_path).await?;
        self.mounter
            .bind_mount(&source, staging_path, false, cancel)
            .await
            .map_err(|e| with_context(e, &format!("staging volume {volume_name} at {staging_path}")))?;

        tracing::debug!(
            "Setting quota of {} bytes on volume {} ({})",
            total_capacity,
            volume_name,
            source
        );
        self.filesystem
            .set_quota(
                &drive.status.path,
                &source,
                volume_name,
                Quota::limits(total_capacity, total_capacity),
                cancel,
            )
            .await
    }

    pub async fn publish(
        &self,
        staging_path: &str,
        target_path: &str,
        read_only: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        create_dir(target_path).await?;
        self.mounter
            .bind_mount(staging_path, target_path, read_only, cancel)
            .await
            .map_err(|e| with_context(e, &format!("publishing {staging_path} at {target_path}")))
    }

    pub async fn unpublish(&self, target_path: &str, cancel: &CancellationToken) -> Result<()> {
        self.unmount_if_mounted(target_path, cancel).await
    }

    pub async fn unstage(&self, staging_path: &str, cancel: &CancellationToken) -> Result<()> {
        self.unmount_if_mounted(staging_path, cancel).await
    }

    /// Binds `volume_name` to the drive and allocates `size` bytes of it
    pub async fn claim(
        &self,
        drive_name: &str,
        volume_name: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<Drive> {
        let finalizer = volume_finalizer(volume_name);
        update_with_retry(self.drives.as_ref(), drive_name, cancel, |drive| {
            if drive.meta.has_finalizer(&finalizer) {
                return Ok(false);
            }
            let status = &mut drive.status;
            if !status.drive_status.is_adopted() {
                return Err(AgentError::conflict(format!(
                    "drive {drive_name} is {}, volumes need a Ready or InUse drive",
                    status.drive_status
                )));
            }
            if size > status.free_capacity {
                return Err(AgentError::conflict(format!(
                    "drive {drive_name} has {} bytes free, volume {volume_name} needs {size}",
                    status.free_capacity
                )));
            }
            status.allocated_capacity += size;
            status.free_capacity -= size;
            status.drive_status = DriveState::InUse;
            drive.meta.add_finalizer(&finalizer);
            Ok(true)
        })
        .await
    }

    /// Reverses [`claim`](Self::claim)
    pub async fn release(
        &self,
        drive_name: &str,
        volume_name: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<Drive> {
        let finalizer = volume_finalizer(volume_name);
        update_with_retry(self.drives.as_ref(), drive_name, cancel, |drive| {
            if !drive.meta.remove_finalizer(&finalizer) {
                return Ok(false);
            }
            let has_volumes = drive.has_volumes();
            let status = &mut drive.status;
            status.allocated_capacity = status.allocated_capacity.saturating_sub(size);
            status.free_capacity = status.total_capacity.saturating_sub(status.allocated_capacity);
            if !has_volumes && status.drive_status == DriveState::InUse {
                status.drive_status = DriveState::Ready;
            }
            Ok(true)
        })
        .await
    }

    async fn unmount_if_mounted(&self, target: &str, cancel: &CancellationToken) -> Result<()> {
        if !self.mounter.is_mounted(target).await? {
            return Ok(());
        }
        self.mounter.unmount(target, cancel).await.map_err(|e| {
            if e.is(ErrorKind::Cancelled) {
                e
            } else {
                AgentError::internal(format!("Failed to unmount {target}: {}", e.message))
            }
        })
    }
}

async fn create_dir(path: &str) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| AgentError::new(ErrorKind::MountFailure, format!("Failed to create {path}: {e}")))
}

fn with_context(err: AgentError, context: &str) -> AgentError {
    if err.is(ErrorKind::Cancelled) {
        return err;
    }
    AgentError {
        message: format!("{context}: {}", err.message),
        ..err
    }
}
