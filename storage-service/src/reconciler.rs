// SPDX-License-Identifier: GPL-3.0-only

//! Drive reconciliation
//!
//! One pass probes the host, matches every drive record of this node against the probed
//! devices, rewrites records whose recomputed state differs and creates records for
//! devices nobody claimed. Formatting is never done inline; `Available` records asking
//! for a format are handed back as [`FormatRequest`]s.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use storage_contracts::{
    AgentError, DeviceProbe, DriveRegistry, ErrorKind, MountOps, Result, VolumeRegistry,
    list_all, with_cancel,
};
use storage_sys::Backoff;
use storage_types::labels::{DATA_PROTECTION_FINALIZER, DRIVE_PATH_LABEL};
use storage_types::{Device, Drive, DriveCondition, DriveState, MajorMinor, Volume};

use crate::availability;
use crate::config::AgentConfig;
use crate::format::FormatRequest;
use crate::matcher::{MatchOutcome, awaiting_udev, match_drive};
use crate::records::{
    self, LIST_PAGE_SIZE, XFS, drive_mount_options, reason, set_condition,
};
use crate::retry::{retry_on_conflict, update_with_retry};

const LABEL_SYNC_ATTEMPTS: u32 = 10;

/// What one pass did, by drive name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub lost: Vec<String>,
    pub duplicates: Vec<String>,
    pub skipped: Vec<String>,
    pub format_requests: Vec<FormatRequest>,
}

impl ReconcileReport {
    /// Number of registry writes
    pub fn writes(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len() + self.lost.len()
    }
}

#[derive(Debug)]
enum Write {
    Unchanged,
    Updated,
    Lost,
    Deleted,
}

#[derive(Debug)]
struct Synced {
    write: Write,
    format: Option<FormatRequest>,
}

impl Synced {
    fn write(write: Write) -> Self {
        Self { write, format: None }
    }
}

pub struct Reconciler {
    config: Arc<AgentConfig>,
    probe: Arc<dyn DeviceProbe>,
    mounter: Arc<dyn MountOps>,
    drives: Arc<DriveRegistry>,
    volumes: Arc<VolumeRegistry>,
    background: Mutex<JoinSet<()>>,
    tracked: Mutex<BTreeSet<MajorMinor>>,
}

impl Reconciler {
    pub fn new(
        config: Arc<AgentConfig>,
        probe: Arc<dyn DeviceProbe>,
        mounter: Arc<dyn MountOps>,
        drives: Arc<DriveRegistry>,
        volumes: Arc<VolumeRegistry>,
    ) -> Self {
        Self {
            config,
            probe,
            mounter,
            drives,
            volumes,
            background: Mutex::new(JoinSet::new()),
            tracked: Mutex::new(BTreeSet::new()),
        }
    }

    /// Whether the last pass saw a drive backed by `major_minor`
    pub fn tracks(&self, major_minor: MajorMinor) -> bool {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&major_minor)
    }

    /// Waits for every background label sync spawned so far
    pub async fn wait_background(&self) {
        let mut tasks = {
            let mut guard = self.background.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                warn!("label sync task failed: {err}");
            }
        }
    }

    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<ReconcileReport> {
        let mut pool = self.probe_devices(cancel).await?;
        let drives = with_cancel(
            cancel,
            list_all(self.drives.as_ref(), &records::node_selector(&self.config), LIST_PAGE_SIZE),
        )
        .await?;
        debug!(devices = pool.len(), drives = drives.len(), "reconciling");

        let mut report = ReconcileReport::default();
        let mut held_back = BTreeSet::new();
        let mut tracked = BTreeSet::new();

        for drive in drives {
            if cancel.is_cancelled() {
                return Err(AgentError::cancelled());
            }
            let name = drive.meta.name.clone();
            let result = match match_drive(&drive, &mut pool) {
                MatchOutcome::Duplicate(candidates) => {
                    let err = AgentError::new(
                        ErrorKind::DuplicateDevice,
                        format!(
                            "drive {name} matches {} devices: {}",
                            candidates.len(),
                            candidates.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
                        ),
                    );
                    warn!(drive = %name, "skipping drive this cycle: {err}");
                    held_back.extend(candidates);
                    report.duplicates.push(name);
                    continue;
                }
                MatchOutcome::Matched(device) => {
                    tracked.insert(device.major_minor);
                    self.sync_matched(drive, *device, cancel).await
                }
                MatchOutcome::NoMatch => match awaiting_udev(&drive, &pool) {
                    Some(index) => {
                        let device = pool.remove(index);
                        debug!(
                            drive = %name,
                            device = %device.name,
                            "udev has not caught up with the filesystem yet"
                        );
                        tracked.insert(device.major_minor);
                        continue;
                    }
                    None => self.sync_unmatched(drive, cancel).await,
                },
            };

            match result {
                Ok(synced) => {
                    match synced.write {
                        Write::Unchanged => {}
                        Write::Updated => report.updated.push(name),
                        Write::Lost => report.lost.push(name),
                        Write::Deleted => report.deleted.push(name),
                    }
                    report.format_requests.extend(synced.format);
                }
                Err(err) if err.is(ErrorKind::Cancelled) => return Err(err),
                Err(err) => {
                    warn!(drive = %name, "skipping drive this cycle: {err}");
                    report.skipped.push(name);
                }
            }
        }

        for device in pool {
            if held_back.contains(&device.major_minor) {
                debug!(device = %device.name, "device held back by duplicate match");
                continue;
            }
            match self.create_drive(&device).await {
                Ok(drive) => {
                    tracked.insert(device.major_minor);
                    report.created.push(drive.meta.name);
                }
                Err(err) if err.is(ErrorKind::Cancelled) => return Err(err),
                Err(err) => {
                    warn!(device = %device.name, "failed to create drive record: {err}");
                    report.skipped.push(device.name);
                }
            }
        }

        *self.tracked.lock().unwrap_or_else(PoisonError::into_inner) = tracked;
        if report.writes() > 0 {
            info!(
                created = report.created.len(),
                updated = report.updated.len(),
                deleted = report.deleted.len(),
                lost = report.lost.len(),
                "reconcile pass finished"
            );
        }
        Ok(report)
    }

    async fn probe_devices(&self, cancel: &CancellationToken) -> Result<Vec<Device>> {
        let probe = Arc::clone(&self.probe);
        let task = tokio::task::spawn_blocking(move || probe.probe_devices());
        with_cancel(cancel, async move {
            task.await
                .map_err(|err| AgentError::internal(format!("device probe task failed: {err}")))?
        })
        .await
    }

    async fn create_drive(&self, device: &Device) -> Result<Drive> {
        let now = Utc::now();
        let mut drive = records::new_drive(&self.config, &Uuid::new_v4().to_string(), device);
        let status = &mut drive.status;
        records::set_candidate_conditions(status, now);

        match availability::check(device, &self.config.mount_root(), self.config.availability_mount_policy) {
            Ok(()) => {
                status.drive_status = DriveState::Available;
                set_condition(status, DriveCondition::Ready, false, reason::NOT_ADOPTED, "", now);
            }
            Err(unavailable) => {
                status.drive_status = DriveState::Unavailable;
                let message = unavailable.to_string();
                set_condition(status, DriveCondition::Ready, false, unavailable.reason(), &message, now);
            }
        }

        let created = self.drives.create(drive).await?;
        info!(
            drive = %created.meta.name,
            device = %device.name,
            state = %created.status.drive_status,
            "drive record created"
        );
        Ok(created)
    }

    async fn sync_matched(
        &self,
        listed: Drive,
        device: Device,
        cancel: &CancellationToken,
    ) -> Result<Synced> {
        let device = &device;
        retry_on_conflict(cancel, move |attempt| {
            let listed = listed.clone();
            async move {
                let current = if attempt == 0 {
                    listed
                } else {
                    self.drives.get(&listed.meta.name).await?
                };
                self.apply_matched(current, device, cancel).await
            }
        })
        .await
    }

    async fn apply_matched(
        &self,
        current: Drive,
        device: &Device,
        cancel: &CancellationToken,
    ) -> Result<Synced> {
        let state = current.status.drive_status;
        if state == DriveState::Terminating && !current.has_volumes() {
            self.retire(&current, cancel).await?;
            return Ok(Synced::write(Write::Deleted));
        }

        let now = Utc::now();
        let mut next = current.clone();
        let fill_only = !matches!(state, DriveState::Available | DriveState::Unavailable);
        records::copy_identity(&mut next.status, device, fill_only);
        records::copy_state(&mut next.status, device);
        records::set_capacity(&mut next.status, device);
        records::refresh_placement(&mut next, &self.config, device);

        let mut format = None;
        match state {
            DriveState::Ready | DriveState::InUse | DriveState::Lost => {
                if state == DriveState::Lost {
                    info!(drive = %next.meta.name, device = %device.name, "lost drive found again");
                }
                self.sync_adopted(&mut next, device, current.status.total_capacity, cancel, now)
                    .await?;
            }
            DriveState::Available | DriveState::Unavailable | DriveState::Released => {
                let target = self.config.drive_mount_point(&device.fs_uuid);
                let formatted_here = next.spec.requested_format.is_some()
                    && !device.fs_uuid.is_empty()
                    && device.mount_points.contains(&target);

                if formatted_here {
                    next.status.drive_status = DriveState::Ready;
                    next.meta.finalizers = vec![DATA_PROTECTION_FINALIZER.to_string()];
                    if let Some(requested) = next.spec.requested_format.take() {
                        next.status.requested_mount_options = requested.mount_options;
                    }
                    self.sync_adopted(&mut next, device, current.status.total_capacity, cancel, now)
                        .await?;
                } else {
                    next.status.mountpoint = device.first_mount_point.clone();
                    next.status.mount_options = device.first_mount_options.clone();
                    if state == DriveState::Released && next.status.mountpoint.is_empty() {
                        next.status.drive_status = DriveState::Available;
                        next.meta.finalizers.clear();
                    }
                    if next.status.drive_status == DriveState::Released {
                        set_released_conditions(&mut next, now);
                    } else {
                        format = self.sync_candidate(&mut next, device, now);
                    }
                }
            }
            DriveState::Terminating => {
                next.status.mountpoint = device.first_mount_point.clone();
                records::set_mounted_condition(&mut next.status, "", now);
            }
        }

        let path_changed = !current.status.path.is_empty() && current.status.path != next.status.path;
        if next == current {
            return Ok(Synced { write: Write::Unchanged, format });
        }

        let updated = self.drives.update(next).await?;
        if updated.status.drive_status != state {
            info!(
                drive = %updated.meta.name,
                from = %state,
                to = %updated.status.drive_status,
                "drive state changed"
            );
        }
        if path_changed && updated.has_volumes() {
            self.spawn_label_sync(&updated, cancel);
        }
        Ok(Synced { write: Write::Updated, format })
    }

    /// Mounts an adopted drive at its target if needed and validates what was matched.
    async fn sync_adopted(
        &self,
        drive: &mut Drive,
        device: &Device,
        recorded_capacity: u64,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<()> {
        drive.status.drive_status = if drive.has_volumes() {
            DriveState::InUse
        } else {
            DriveState::Ready
        };
        if drive.meta.finalizers.is_empty() {
            drive.meta.add_finalizer(DATA_PROTECTION_FINALIZER);
        }

        let status = &mut drive.status;
        let target = self.config.drive_mount_point(&status.fs_uuid);
        let mut mount_error = None;

        if status.fs_uuid.is_empty() {
            status.mountpoint.clear();
            mount_error = Some("drive has no filesystem UUID".to_string());
        } else if device.mount_points.contains(&target) {
            status.mountpoint = target.clone();
            if device.first_mount_point == target {
                status.mount_options = device.first_mount_options.clone();
            }
        } else {
            let options = drive_mount_options(&status.requested_mount_options);
            match self
                .mounter
                .mount_device(&device.path(), &target, XFS, &options, cancel)
                .await
            {
                Ok(()) => {
                    info!(drive = %drive.meta.name, target = %target, "drive mounted");
                    status.mountpoint = target.clone();
                    status.mount_options = options;
                }
                Err(err) if err.is(ErrorKind::Cancelled) => return Err(err),
                Err(err) => {
                    warn!(drive = %drive.meta.name, target = %target, "failed to mount drive: {err}");
                    status.mountpoint.clear();
                    mount_error = Some(err.message);
                }
            }
        }

        set_condition(status, DriveCondition::Owned, true, reason::ADDED, "", now);
        records::set_mounted_condition(status, mount_error.as_deref().unwrap_or_default(), now);
        records::set_formatted_condition(status, now);

        let problems = if mount_error.is_none() {
            validate_adopted(device, &target, &status.mountpoint, recorded_capacity)
        } else {
            Vec::new()
        };
        let initialized = match (&mount_error, problems.is_empty()) {
            (Some(message), _) => {
                set_condition(status, DriveCondition::Initialized, false, reason::MOUNT_FAILED, message, now);
                false
            }
            (None, false) => {
                let message = problems.join("; ");
                warn!(drive = %drive.meta.name, "drive failed validation: {message}");
                set_condition(status, DriveCondition::Initialized, false, reason::INVALID, &message, now);
                false
            }
            (None, true) => {
                set_condition(status, DriveCondition::Initialized, true, reason::INITIALIZED, "", now);
                true
            }
        };

        if initialized && !status.mountpoint.is_empty() {
            set_condition(status, DriveCondition::Ready, true, reason::READY, "", now);
        } else {
            let message = status
                .conditions
                .get(DriveCondition::Initialized.as_str())
                .filter(|_| !initialized)
                .map(|c| c.message.clone())
                .unwrap_or_default();
            set_condition(status, DriveCondition::Ready, false, reason::NOT_READY, &message, now);
        }
        Ok(())
    }

    /// Availability for a record nobody has adopted; returns the format request when one
    /// is pending.
    fn sync_candidate(&self, drive: &mut Drive, device: &Device, now: DateTime<Utc>) -> Option<FormatRequest> {
        let status = &mut drive.status;
        records::set_candidate_conditions(status, now);

        match availability::check(device, &self.config.mount_root(), self.config.availability_mount_policy) {
            Ok(()) => {
                status.drive_status = DriveState::Available;
                set_condition(status, DriveCondition::Ready, false, reason::NOT_ADOPTED, "", now);
                drive.spec.requested_format.as_ref().map(|requested| FormatRequest {
                    name: drive.meta.name.clone(),
                    major_minor: device.major_minor,
                    force: requested.force,
                    udev_data: device.udev_data.clone(),
                    mount_options: requested.mount_options.clone(),
                })
            }
            Err(unavailable) => {
                status.drive_status = DriveState::Unavailable;
                let message = unavailable.to_string();
                set_condition(status, DriveCondition::Ready, false, unavailable.reason(), &message, now);
                if drive.spec.requested_format.is_some() {
                    warn!(drive = %drive.meta.name, "format requested on unavailable drive: {message}");
                }
                None
            }
        }
    }

    async fn sync_unmatched(&self, listed: Drive, cancel: &CancellationToken) -> Result<Synced> {
        retry_on_conflict(cancel, move |attempt| {
            let listed = listed.clone();
            async move {
                let current = if attempt == 0 {
                    listed
                } else {
                    self.drives.get(&listed.meta.name).await?
                };
                self.apply_unmatched(current).await
            }
        })
        .await
    }

    async fn apply_unmatched(&self, current: Drive) -> Result<Synced> {
        let name = current.meta.name.clone();
        let state = current.status.drive_status;
        match state {
            DriveState::Ready | DriveState::InUse => {
                let now = Utc::now();
                let mut next = current;
                next.status.drive_status = DriveState::Lost;
                next.status.mountpoint.clear();
                next.status.mount_options.clear();
                let message = "no device matches the recorded identity";
                set_condition(&mut next.status, DriveCondition::Mounted, false, reason::DRIVE_LOST, message, now);
                set_condition(&mut next.status, DriveCondition::Ready, false, reason::DRIVE_LOST, message, now);
                self.drives.update(next).await?;
                warn!(drive = %name, "drive lost");
                Ok(Synced::write(Write::Lost))
            }
            DriveState::Lost => Ok(Synced::write(Write::Unchanged)),
            _ if current.has_volumes() => {
                debug!(drive = %name, "unmatched drive still has volumes");
                Ok(Synced::write(Write::Unchanged))
            }
            _ => {
                self.delete(&name).await?;
                info!(drive = %name, state = %state, "drive record removed");
                Ok(Synced::write(Write::Deleted))
            }
        }
    }

    /// Unmounts a terminating drive and removes its record
    async fn retire(&self, drive: &Drive, cancel: &CancellationToken) -> Result<()> {
        let mountpoint = &drive.status.mountpoint;
        if !mountpoint.is_empty() && self.mounter.is_mounted(mountpoint).await? {
            self.mounter.unmount(mountpoint, cancel).await?;
        }
        self.delete(&drive.meta.name).await?;
        info!(drive = %drive.meta.name, "terminated drive removed");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.drives.delete(name).await {
            Err(err) if err.is(ErrorKind::NotFound) => Ok(()),
            result => result,
        }
    }

    fn spawn_label_sync(&self, drive: &Drive, cancel: &CancellationToken) {
        let volumes = Arc::clone(&self.volumes);
        let names = drive.volume_names();
        let path = drive.status.path.clone();
        let drive_name = drive.meta.name.clone();
        let cancel = cancel.clone();

        let mut tasks = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            for volume in names {
                sync_drive_path_label(volumes.as_ref(), &drive_name, &volume, &path, &cancel).await;
            }
        });
    }
}

fn set_released_conditions(drive: &mut Drive, now: DateTime<Utc>) {
    let status = &mut drive.status;
    set_condition(status, DriveCondition::Owned, true, reason::ADDED, "", now);
    records::set_mounted_condition(status, "", now);
    records::set_formatted_condition(status, now);
    set_condition(status, DriveCondition::Ready, false, reason::RELEASED, "", now);
}

/// Invariants an adopted drive must keep; one message per violation
fn validate_adopted(device: &Device, target: &str, mountpoint: &str, recorded_capacity: u64) -> Vec<String> {
    let mut problems = Vec::new();
    let first = if device.first_mount_point.is_empty() {
        mountpoint
    } else {
        device.first_mount_point.as_str()
    };
    if first != target {
        problems.push(format!("Mountpoint mismatch - Expected {target} found {first}"));
    }
    if device.total_capacity < recorded_capacity {
        problems.push(format!(
            "TotalCapacity mismatch - Expected at least {recorded_capacity} found {}",
            device.total_capacity
        ));
    }
    if device.read_only {
        problems.push("ReadOnly mismatch - Expected false found true".to_string());
    }
    if device.hidden {
        problems.push("Hidden mismatch - Expected false found true".to_string());
    }
    if device.swap_on {
        problems.push("SwapOn mismatch - Expected false found true".to_string());
    }
    if !device.master.is_empty() {
        problems.push(format!("Master mismatch - Expected none found {}", device.master));
    }
    if !device.holders.is_empty() {
        problems.push(format!(
            "Holders mismatch - Expected none found {}",
            device.holders.join(",")
        ));
    }
    problems
}

async fn sync_drive_path_label(
    volumes: &VolumeRegistry,
    drive_name: &str,
    volume: &str,
    path: &str,
    cancel: &CancellationToken,
) {
    let mut backoff = Backoff::new(Duration::from_secs(1), 2.0, 0.1, 4);
    for attempt in 1..=LABEL_SYNC_ATTEMPTS {
        let result = update_with_retry(volumes, volume, cancel, |record: &mut Volume| {
            if record.meta.label(DRIVE_PATH_LABEL) == Some(path) {
                return Ok(false);
            }
            record.meta.set_label(DRIVE_PATH_LABEL, path);
            Ok(true)
        })
        .await;

        match result {
            Ok(_) => {
                debug!(drive = %drive_name, volume, path, "volume drive-path label synced");
                return;
            }
            Err(err) if err.is(ErrorKind::Cancelled) => return,
            Err(err) if err.is(ErrorKind::NotFound) => {
                warn!(drive = %drive_name, volume, "volume named by drive finalizer is missing");
                return;
            }
            Err(err) => {
                warn!(drive = %drive_name, volume, attempt, "failed to sync drive-path label: {err}");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff.next_delay()) => {}
        }
    }
    warn!(drive = %drive_name, volume, "giving up on drive-path label sync");
}
