// SPDX-License-Identifier: GPL-3.0-only

pub mod host;
pub mod registry;

pub use host::{DeviceProbe, FilesystemOps, MountOps};
pub use registry::{DriveRegistry, Registry, VolumeRegistry, WatchEvent, list_all};
