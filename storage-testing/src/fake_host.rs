use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use storage_contracts::{
    AgentError, DeviceProbe, ErrorKind, FilesystemOps, MountOps, Result, with_cancel,
};
use storage_types::{Device, FsInfo, MajorMinor, Quota};

/// Host operations that can be observed and made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    Probe,
    Mount,
    BindMount,
    Unmount,
    Format,
    FsProbe,
    SetQuota,
    GetQuota,
}

impl HostOp {
    fn error_kind(self) -> ErrorKind {
        match self {
            Self::Probe | Self::FsProbe => ErrorKind::Internal,
            Self::Mount | Self::BindMount => ErrorKind::MountFailure,
            Self::Unmount => ErrorKind::UnmountFailure,
            Self::Format => ErrorKind::FormatFailure,
            Self::SetQuota | Self::GetQuota => ErrorKind::QuotaFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeMount {
    pub source: String,
    pub target: String,
    pub fs_type: String,
    pub options: Vec<String>,
    pub read_only: bool,
}

#[derive(Debug, Default)]
struct HostState {
    devices: BTreeMap<MajorMinor, Device>,
    mounts: Vec<FakeMount>,
    quotas: BTreeMap<(String, String), Quota>,
    failures: HashMap<HostOp, VecDeque<String>>,
    calls: Vec<(HostOp, String)>,
    udev_lag: bool,
    /// Filesystem UUIDs written while udev lagged, not yet visible in its view
    pending_udev: BTreeMap<MajorMinor, String>,
}

impl HostState {
    fn record(&mut self, op: HostOp, target: &str) -> Result<()> {
        self.calls.push((op, target.to_string()));
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(message) => Err(AgentError::new(op.error_kind(), message)),
            None => Ok(()),
        }
    }

    fn device_by_path(&mut self, path: &str) -> Option<&mut Device> {
        self.devices.values_mut().find(|device| device.path() == path)
    }

    fn is_mounted(&self, target: &str) -> bool {
        let target = normalize(target);
        self.mounts.iter().any(|m| normalize(&m.target) == target)
    }

    /// Device path behind `source`, following bind mounts of directories inside mounts
    fn backing_device(&self, source: &str) -> Option<String> {
        if source.starts_with("/dev/") {
            return Some(source.to_string());
        }
        self.mounts
            .iter()
            .filter(|m| m.source.starts_with("/dev/"))
            .find(|m| {
                let target = normalize(&m.target);
                source == target || source.starts_with(&format!("{target}/"))
            })
            .map(|m| m.source.clone())
    }

    fn snapshot(&self, device: &Device) -> Device {
        let mut snapshot = device.clone();
        let path = device.path();
        for mount in &self.mounts {
            if self.backing_device(&mount.source).as_deref() != Some(path.as_str()) {
                continue;
            }
            if snapshot.mount_points.is_empty() {
                snapshot.first_mount_point = mount.target.clone();
                let mut options = mount.options.clone();
                options.push(if mount.read_only { "ro" } else { "rw" }.to_string());
                options.sort();
                snapshot.first_mount_options = options;
            }
            snapshot.mount_points.push(mount.target.clone());
        }
        snapshot
    }
}

/// In-memory host: block devices, a mount table, XFS formatting and project quotas.
///
/// Clones share state, so a test keeps one handle while the service owns others.
/// Mounting and bind mounting create their target directories on the real filesystem
/// so the service can write files beneath them.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let host = Self::new();
        for device in devices {
            host.add_device(device);
        }
        host
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_device(&self, device: Device) {
        self.state().devices.insert(device.major_minor, device);
    }

    pub fn remove_device(&self, major_minor: MajorMinor) -> Option<Device> {
        self.state().devices.remove(&major_minor)
    }

    pub fn device(&self, major_minor: MajorMinor) -> Option<Device> {
        let state = self.state();
        state.devices.get(&major_minor).map(|d| state.snapshot(d))
    }

    /// Changes one udev property without touching the typed fields
    pub fn set_udev_value(&self, major_minor: MajorMinor, key: &str, value: &str) {
        if let Some(device) = self.state().devices.get_mut(&major_minor) {
            device.udev_data.insert(key.to_string(), value.to_string());
        }
    }

    /// Keeps the udev view of formatted devices stale until [`FakeHost::settle_udev`].
    ///
    /// The superblock changes at once, so the probed filesystem UUID is new while the
    /// udev filesystem UUID and `ID_FS_*` properties still describe the old contents.
    pub fn lag_udev(&self) {
        self.state().udev_lag = true;
    }

    /// Publishes every udev update held back by [`FakeHost::lag_udev`] and stops lagging
    pub fn settle_udev(&self) {
        let mut state = self.state();
        state.udev_lag = false;
        let pending = std::mem::take(&mut state.pending_udev);
        for (major_minor, fs_uuid) in pending {
            if let Some(device) = state.devices.get_mut(&major_minor) {
                publish_udev(device, &fs_uuid);
            }
        }
    }

    /// Makes the next call of `op` fail with `message`; repeated calls queue failures
    pub fn fail_next(&self, op: HostOp, message: &str) {
        self.state()
            .failures
            .entry(op)
            .or_default()
            .push_back(message.to_string());
    }

    /// Targets passed to `op`, in call order
    pub fn calls(&self, op: HostOp) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|(called, _)| *called == op)
            .map(|(_, target)| target.clone())
            .collect()
    }

    pub fn mounts(&self) -> Vec<FakeMount> {
        self.state().mounts.clone()
    }

    pub fn mounted(&self, target: &str) -> bool {
        self.state().is_mounted(target)
    }

    /// Mounts something behind the service's back, as an operator would
    pub fn external_mount(&self, source: &str, target: &str) {
        self.state().mounts.push(FakeMount {
            source: source.to_string(),
            target: target.to_string(),
            fs_type: "xfs".to_string(),
            options: Vec::new(),
            read_only: false,
        });
    }

    pub fn quota(&self, device: &str, volume_name: &str) -> Option<Quota> {
        self.state()
            .quotas
            .get(&(device.to_string(), volume_name.to_string()))
            .copied()
    }
}

impl DeviceProbe for FakeHost {
    fn probe_devices(&self) -> Result<Vec<Device>> {
        let mut state = self.state();
        state.record(HostOp::Probe, "")?;
        Ok(state.devices.values().map(|d| state.snapshot(d)).collect())
    }

    fn read_udev_data(&self, major_minor: MajorMinor) -> Result<BTreeMap<String, String>> {
        self.state()
            .devices
            .get(&major_minor)
            .map(|device| device.udev_data.clone())
            .ok_or_else(|| AgentError::not_found("device", &major_minor.to_string()))
    }
}

#[async_trait]
impl MountOps for FakeHost {
    async fn mount_device(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        with_cancel(cancel, async {
            let mut state = self.state();
            state.record(HostOp::Mount, target)?;
            if let Some(existing) = state
                .mounts
                .iter()
                .find(|m| normalize(&m.target) == normalize(target))
            {
                if existing.source == device {
                    return Ok(());
                }
                return Err(AgentError::new(
                    ErrorKind::MountFailure,
                    format!("{target} is already mounted from {}", existing.source),
                ));
            }

            let formatted = state
                .device_by_path(device)
                .map(|d| d.fs_type == fs_type)
                .ok_or_else(|| AgentError::new(ErrorKind::MountFailure, format!("{device}: no such device")))?;
            if !formatted {
                return Err(AgentError::new(
                    ErrorKind::MountFailure,
                    format!("mount {device} on {target}: wrong fs type"),
                ));
            }

            std::fs::create_dir_all(target)
                .map_err(|e| AgentError::new(ErrorKind::MountFailure, e.to_string()))?;
            state.mounts.push(FakeMount {
                source: device.to_string(),
                target: normalize(target).to_string(),
                fs_type: fs_type.to_string(),
                read_only: options.iter().any(|o| o == "ro"),
                options: options.iter().filter(|o| *o != "ro" && *o != "rw").cloned().collect(),
            });
            Ok(())
        })
        .await
    }

    async fn bind_mount(
        &self,
        source: &str,
        target: &str,
        read_only: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        with_cancel(cancel, async {
            let mut state = self.state();
            state.record(HostOp::BindMount, target)?;
            if state.is_mounted(target) {
                return Ok(());
            }
            std::fs::create_dir_all(target)
                .map_err(|e| AgentError::new(ErrorKind::MountFailure, e.to_string()))?;
            state.mounts.push(FakeMount {
                source: source.to_string(),
                target: normalize(target).to_string(),
                fs_type: "xfs".to_string(),
                options: vec!["bind".to_string()],
                read_only,
            });
            Ok(())
        })
        .await
    }

    async fn unmount(&self, target: &str, cancel: &CancellationToken) -> Result<()> {
        with_cancel(cancel, async {
            let mut state = self.state();
            state.record(HostOp::Unmount, target)?;
            let target = normalize(target);
            if let Some(index) = state.mounts.iter().rposition(|m| normalize(&m.target) == target) {
                state.mounts.remove(index);
            }
            Ok(())
        })
        .await
    }

    async fn is_mounted(&self, target: &str) -> Result<bool> {
        Ok(self.state().is_mounted(target))
    }
}

#[async_trait]
impl FilesystemOps for FakeHost {
    async fn format(
        &self,
        device: &str,
        fs_uuid: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        with_cancel(cancel, async {
            let mut state = self.state();
            state.record(HostOp::Format, device)?;
            let lagging = state.udev_lag;
            let target = state.device_by_path(device).ok_or_else(|| {
                AgentError::new(ErrorKind::FormatFailure, format!("{device}: no such device"))
            })?;
            if !target.fs_type.is_empty() && !force {
                return Err(AgentError::new(
                    ErrorKind::FormatFailure,
                    format!("{device} contains a {} filesystem; use force", target.fs_type),
                ));
            }
            target.fs_type = "xfs".to_string();
            target.fs_uuid = fs_uuid.to_string();
            target.free_capacity = target.size;
            if lagging {
                let major_minor = target.major_minor;
                state.pending_udev.insert(major_minor, fs_uuid.to_string());
            } else {
                publish_udev(target, fs_uuid);
            }
            Ok(())
        })
        .await
    }

    async fn probe(&self, device: &str, cancel: &CancellationToken) -> Result<FsInfo> {
        with_cancel(cancel, async {
            let mut state = self.state();
            state.record(HostOp::FsProbe, device)?;
            let target = state
                .device_by_path(device)
                .ok_or_else(|| AgentError::not_found("device", device))?;
            if target.fs_type != "xfs" {
                return Err(AgentError::new(
                    ErrorKind::NoFilesystem,
                    format!("No filesystem found on {device}"),
                ));
            }
            Ok(FsInfo {
                fs_uuid: target.fs_uuid.clone(),
                fs_type: target.fs_type.clone(),
                label: "LOCALDRIVE".to_string(),
                block_size: 4096,
                total_bytes: target.size,
                free_bytes: target.free_capacity,
            })
        })
        .await
    }

    async fn set_quota(
        &self,
        device: &str,
        path: &str,
        volume_name: &str,
        quota: Quota,
        cancel: &CancellationToken,
    ) -> Result<()> {
        with_cancel(cancel, async {
            let mut state = self.state();
            state.record(HostOp::SetQuota, path)?;
            state
                .quotas
                .entry((device.to_string(), volume_name.to_string()))
                .or_insert(quota);
            Ok(())
        })
        .await
    }

    async fn get_quota(
        &self,
        device: &str,
        volume_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Quota> {
        with_cancel(cancel, async {
            let mut state = self.state();
            state.record(HostOp::GetQuota, device)?;
            state
                .quotas
                .get(&(device.to_string(), volume_name.to_string()))
                .copied()
                .ok_or_else(|| AgentError::not_found("quota", volume_name))
        })
        .await
    }
}

fn publish_udev(device: &mut Device, fs_uuid: &str) {
    device.uevent_fs_uuid = fs_uuid.to_string();
    device.udev_data.insert("ID_FS_TYPE".to_string(), "xfs".to_string());
    device.udev_data.insert("ID_FS_UUID".to_string(), fs_uuid.to_string());
}

fn normalize(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}
