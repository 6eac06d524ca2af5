// SPDX-License-Identifier: GPL-3.0-only

//! Format/mount service
//!
//! Turns an `Available` drive into an adopted `Ready` drive: formats the device with a
//! fresh filesystem UUID, mounts it under the mount root, stamps identity metadata and
//! registers the result. Requests for the same device are serialized.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use storage_contracts::{
    AgentError, DeviceProbe, DriveRegistry, ErrorKind, FilesystemOps, MountOps, Result,
    with_cancel,
};
use storage_sys::Backoff;
use storage_sys::udev::{ID_FS_TYPE, ID_FS_UUID};
use storage_types::labels::DATA_PROTECTION_FINALIZER;
use storage_types::{
    Device, Drive, DriveCondition, DriveState, FormatMetadata, FsInfo, MajorMinor,
};

use crate::config::AgentConfig;
use crate::records::{self, XFS, drive_mount_options, reason, set_condition};
use crate::retry::update_with_retry;

/// Hidden directory inside every formatted drive
pub const METADATA_DIR: &str = ".localdrive.sys";
pub const METADATA_FILE: &str = "metadata.json";
/// Directory under the mount root holding `<device-name>` aliases
pub const ALIAS_DIR: &str = ".by-name";

/// Reads of the udev view after formatting before the record is written regardless
const UDEV_SETTLE_ATTEMPTS: u32 = 5;

fn udev_settle_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(20), 2.0, 0.1, 4)
}

/// Request to format one device, carrying the udev view it was decided on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatRequest {
    /// Drive record the result is registered on when it exists
    pub name: String,
    pub major_minor: MajorMinor,
    pub force: bool,
    pub udev_data: BTreeMap<String, String>,
    pub mount_options: Vec<String>,
}

/// Per-device async locks, created on first use and kept for the process lifetime
#[derive(Default)]
struct DeviceLocks {
    locks: Mutex<HashMap<MajorMinor, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeviceLocks {
    fn get(&self, major_minor: MajorMinor) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(major_minor).or_default())
    }
}

/// What a successful format produced
struct Formatted<'a> {
    device: &'a Device,
    fs_uuid: &'a str,
    target: &'a str,
    options: &'a [String],
    requested_options: &'a [String],
    info: FsInfo,
}

pub struct FormatService {
    config: Arc<AgentConfig>,
    probe: Arc<dyn DeviceProbe>,
    mounter: Arc<dyn MountOps>,
    filesystem: Arc<dyn FilesystemOps>,
    drives: Arc<DriveRegistry>,
    locks: DeviceLocks,
}

impl FormatService {
    pub fn new(
        config: Arc<AgentConfig>,
        probe: Arc<dyn DeviceProbe>,
        mounter: Arc<dyn MountOps>,
        filesystem: Arc<dyn FilesystemOps>,
        drives: Arc<DriveRegistry>,
    ) -> Self {
        Self {
            config,
            probe,
            mounter,
            filesystem,
            drives,
            locks: DeviceLocks::default(),
        }
    }

    /// Formats and mounts the device of `request` and registers it as a `Ready` drive.
    ///
    /// Fails with `UdevMismatch` when the device changed since the request was made and
    /// with `ForceRequired` when it already carries a filesystem and `force` is unset.
    /// Anything failing after the mount unmounts the new target again.
    pub async fn format(&self, request: &FormatRequest, cancel: &CancellationToken) -> Result<Drive> {
        let lock = self.locks.get(request.major_minor);
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::cancelled()),
            guard = lock.lock() => guard,
        };

        let udev_data = self.read_udev_data(request.major_minor, cancel).await?;
        if udev_data != request.udev_data {
            return Err(AgentError::new(
                ErrorKind::UdevMismatch,
                format!("udev data of {} changed since the format was requested", request.major_minor),
            )
            .with_suggestion("Retry the format after the next reconcile pass"));
        }
        if !request.force && udev_data.get(ID_FS_TYPE).is_some_and(|fs| !fs.is_empty()) {
            return Err(AgentError::new(
                ErrorKind::ForceRequired,
                format!("{} already contains a filesystem", request.major_minor),
            )
            .with_suggestion("Set force to overwrite the existing filesystem"));
        }

        let device = self.find_device(request.major_minor, cancel).await?;
        let path = device.path();
        let fs_uuid = Uuid::new_v4().to_string();

        tracing::info!("Formatting {} with filesystem UUID {}", path, fs_uuid);
        self.filesystem
            .format(&path, &fs_uuid, request.force, cancel)
            .await?;

        let target = self.config.drive_mount_point(&fs_uuid);
        tokio::fs::create_dir_all(&target).await.map_err(|e| {
            AgentError::new(ErrorKind::MountFailure, format!("Failed to create {target}: {e}"))
        })?;
        let options = drive_mount_options(&request.mount_options);
        self.mounter
            .mount_device(&path, &target, XFS, &options, cancel)
            .await?;

        match self
            .finish(request, &device, &fs_uuid, &target, &options, cancel)
            .await
        {
            Ok(drive) => {
                tracing::info!("Drive {} is ready at {}", drive.meta.name, target);
                Ok(drive)
            }
            Err(err) => Err(self.rollback(&target, err).await),
        }
    }

    /// Operator release of a `Ready` drive: unmounts it and marks it `Released`
    pub async fn release(&self, drive_name: &str, cancel: &CancellationToken) -> Result<Drive> {
        let drive = self.drives.get(drive_name).await?;
        check_releasable(&drive)?;

        let lock = self.locks.get(drive.major_minor());
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::cancelled()),
            guard = lock.lock() => guard,
        };

        let target = self.config.drive_mount_point(&drive.status.fs_uuid);
        if self.mounter.is_mounted(&target).await? {
            tracing::info!("Unmounting released drive {} from {}", drive_name, target);
            self.mounter.unmount(&target, cancel).await?;
        }

        update_with_retry(self.drives.as_ref(), drive_name, cancel, |drive| {
            check_releasable(drive)?;
            let now = Utc::now();
            let status = &mut drive.status;
            status.drive_status = DriveState::Released;
            status.mountpoint.clear();
            status.mount_options.clear();
            status.requested_mount_options.clear();
            records::set_mounted_condition(status, "", now);
            set_condition(status, DriveCondition::Ready, false, reason::RELEASED, "", now);
            Ok(true)
        })
        .await
    }

    async fn finish(
        &self,
        request: &FormatRequest,
        device: &Device,
        fs_uuid: &str,
        target: &str,
        options: &[String],
        cancel: &CancellationToken,
    ) -> Result<Drive> {
        let info = self.filesystem.probe(&device.path(), cancel).await?;
        if info.fs_uuid != fs_uuid {
            return Err(AgentError::internal(format!(
                "{} reports filesystem UUID {} after formatting with {fs_uuid}",
                device.path(),
                info.fs_uuid
            )));
        }

        write_metadata(Path::new(target), fs_uuid, &self.config.node_name).await?;
        link_alias(&self.config.mount_root(), &device.name, target).await?;
        self.wait_for_udev(device.major_minor, fs_uuid, cancel).await?;

        let formatted = Formatted {
            device,
            fs_uuid,
            target,
            options,
            requested_options: &request.mount_options,
            info,
        };
        match self.drives.get(&request.name).await {
            Ok(_) => {
                update_with_retry(self.drives.as_ref(), &request.name, cancel, |drive| {
                    self.adopt(drive, &formatted);
                    Ok(true)
                })
                .await
            }
            Err(err) if err.is(ErrorKind::NotFound) => {
                let mut drive = records::new_drive(&self.config, fs_uuid, device);
                self.adopt(&mut drive, &formatted);
                self.drives.create(drive).await
            }
            Err(err) => Err(err),
        }
    }

    fn adopt(&self, drive: &mut Drive, formatted: &Formatted<'_>) {
        let now = Utc::now();
        records::copy_identity(&mut drive.status, formatted.device, false);
        records::copy_state(&mut drive.status, formatted.device);

        let status = &mut drive.status;
        status.fs_uuid = formatted.fs_uuid.to_string();
        status.uevent_fs_uuid = formatted.fs_uuid.to_string();
        status.filesystem = formatted.info.fs_type.clone();
        status.total_capacity = formatted.info.total_bytes;
        status.free_capacity = status.total_capacity.saturating_sub(status.allocated_capacity);
        status.mountpoint = formatted.target.to_string();
        status.mount_options = formatted.options.to_vec();
        status.requested_mount_options = formatted.requested_options.to_vec();
        status.drive_status = DriveState::Ready;

        set_condition(status, DriveCondition::Owned, true, reason::ADDED, "", now);
        records::set_mounted_condition(status, "", now);
        records::set_formatted_condition(status, now);
        set_condition(status, DriveCondition::Initialized, true, reason::INITIALIZED, "", now);
        set_condition(status, DriveCondition::Ready, true, reason::READY, "", now);

        drive.spec.requested_format = None;
        drive.meta.add_finalizer(DATA_PROTECTION_FINALIZER);
        records::refresh_placement(drive, &self.config, formatted.device);
    }

    async fn rollback(&self, target: &str, err: AgentError) -> AgentError {
        tracing::warn!("Format of {} failed after mount, unmounting: {}", target, err);
        // The caller's token may already be cancelled; cleanup runs regardless.
        let cleanup = CancellationToken::new();
        match self.mounter.unmount(target, &cleanup).await {
            Ok(()) => err,
            Err(unmount_err) => AgentError::new(
                ErrorKind::UnmountFailure,
                format!("{}; unmounting {target} failed: {}", err.message, unmount_err.message),
            )
            .with_suggestion(format!("Unmount {target} manually before retrying the format")),
        }
    }

    /// Polls udev until it reports `fs_uuid` for the device.
    ///
    /// The record carries the new UUID either way; a view still stale after the last
    /// attempt is held back by the reconciler until udev catches up.
    async fn wait_for_udev(
        &self,
        major_minor: MajorMinor,
        fs_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut backoff = udev_settle_backoff();
        for attempt in 1..=UDEV_SETTLE_ATTEMPTS {
            let udev_data = self.read_udev_data(major_minor, cancel).await?;
            if udev_data.get(ID_FS_UUID).is_some_and(|uuid| uuid == fs_uuid) {
                return Ok(());
            }
            if attempt < UDEV_SETTLE_ATTEMPTS {
                let delay = backoff.next_delay();
                with_cancel(cancel, async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
            }
        }
        tracing::warn!(
            "udev has not published filesystem UUID {} for {} yet",
            fs_uuid,
            major_minor
        );
        Ok(())
    }

    async fn read_udev_data(
        &self,
        major_minor: MajorMinor,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>> {
        let probe = Arc::clone(&self.probe);
        let task = tokio::task::spawn_blocking(move || probe.read_udev_data(major_minor));
        with_cancel(cancel, async move {
            task.await
                .map_err(|e| AgentError::internal(format!("udev read task failed: {e}")))?
        })
        .await
    }

    async fn find_device(&self, major_minor: MajorMinor, cancel: &CancellationToken) -> Result<Device> {
        let probe = Arc::clone(&self.probe);
        let task = tokio::task::spawn_blocking(move || probe.probe_devices());
        let devices = with_cancel(cancel, async move {
            task.await
                .map_err(|e| AgentError::internal(format!("device probe task failed: {e}")))?
        })
        .await?;
        devices
            .into_iter()
            .find(|device| device.major_minor == major_minor)
            .ok_or_else(|| AgentError::not_found("device", &major_minor.to_string()))
    }
}

fn check_releasable(drive: &Drive) -> Result<()> {
    if drive.has_volumes() {
        return Err(AgentError::conflict(format!(
            "drive {} still has volumes: {}",
            drive.meta.name,
            drive.volume_names().join(", ")
        )));
    }
    if drive.status.drive_status != DriveState::Ready {
        return Err(AgentError::conflict(format!(
            "drive {} is {}, only Ready drives can be released",
            drive.meta.name, drive.status.drive_status
        )));
    }
    Ok(())
}

async fn write_metadata(target: &Path, fs_uuid: &str, node_name: &str) -> Result<()> {
    let dir = target.join(METADATA_DIR);
    let metadata = FormatMetadata {
        fsuuid: fs_uuid.to_string(),
        formatted_by: node_name.to_string(),
    };
    let json = serde_json::to_vec_pretty(&metadata)
        .map_err(|e| AgentError::internal(format!("Failed to encode metadata: {e}")))?;

    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| AgentError::internal(format!("Failed to create {}: {e}", dir.display())))?;
    let path = dir.join(METADATA_FILE);
    tokio::fs::write(&path, json)
        .await
        .map_err(|e| AgentError::internal(format!("Failed to write {}: {e}", path.display())))
}

/// Points `<mount-root>/.by-name/<device_name>` at `target`, replacing an older link
async fn link_alias(mount_root: &str, device_name: &str, target: &str) -> Result<()> {
    let dir = Path::new(mount_root).join(ALIAS_DIR);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| AgentError::internal(format!("Failed to create {}: {e}", dir.display())))?;

    let alias = dir.join(device_name);
    if tokio::fs::symlink_metadata(&alias).await.is_ok() {
        tokio::fs::remove_file(&alias).await.map_err(|e| {
            AgentError::internal(format!("Failed to replace {}: {e}", alias.display()))
        })?;
    }
    tokio::fs::symlink(target, &alias)
        .await
        .map_err(|e| AgentError::internal(format!("Failed to link {}: {e}", alias.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_lock_per_device() {
        let locks = DeviceLocks::default();
        let a = locks.get(MajorMinor::new(8, 16));
        let b = locks.get(MajorMinor::new(8, 16));
        let c = locks.get(MajorMinor::new(8, 32));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn alias_is_replaced() {
        let root = tempfile::tempdir().expect("temp dir");
        let mount_root = root.path().display().to_string();

        link_alias(&mount_root, "sdb", "/mnt/first").await.expect("first link");
        link_alias(&mount_root, "sdb", "/mnt/second").await.expect("second link");

        let link = tokio::fs::read_link(root.path().join(ALIAS_DIR).join("sdb"))
            .await
            .expect("read link");
        assert_eq!(link, Path::new("/mnt/second"));
    }

    #[tokio::test]
    async fn metadata_lands_in_hidden_dir() {
        let root = tempfile::tempdir().expect("temp dir");
        write_metadata(root.path(), "u1", "node-1").await.expect("metadata");

        let raw = std::fs::read(root.path().join(METADATA_DIR).join(METADATA_FILE)).expect("read");
        let metadata: FormatMetadata = serde_json::from_slice(&raw).expect("decode");
        assert_eq!(metadata.fsuuid, "u1");
        assert_eq!(metadata.formatted_by, "node-1");
    }

    #[test]
    fn only_ready_drives_without_volumes_release() {
        let mut drive = Drive::new("d1");
        drive.status.drive_status = DriveState::Ready;
        assert!(check_releasable(&drive).is_ok());

        drive
            .meta
            .add_finalizer(&storage_types::labels::volume_finalizer("vol-1"));
        let err = check_releasable(&drive).expect_err("bound volume");
        assert!(err.is(ErrorKind::Conflict));

        let mut lost = Drive::new("d2");
        lost.status.drive_status = DriveState::Lost;
        assert!(check_releasable(&lost).is_err());
    }
}
