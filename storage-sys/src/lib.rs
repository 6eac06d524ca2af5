// SPDX-License-Identifier: GPL-3.0-only

//! Host primitives for the localdrive node agent
//!
//! Everything here talks to the kernel or to system tools directly: the udev database,
//! sysfs, mount-info, mount(2), `mkfs.xfs` and `xfs_quota`. Callers need root.

pub mod backoff;
pub mod command;
pub mod ellipsis;
pub mod error;
pub mod host;
pub mod listener;
pub mod mount;
pub mod mountinfo;
pub mod probe;
pub mod sysfs;
pub mod udev;
pub mod xfs;

pub use backoff::Backoff;
pub use error::{Result, SysError};
pub use host::XfsFilesystem;
pub use listener::{MountEvent, MountEventKind, MountListener, MountSource, ProcMountSource};
pub use mount::Mounter;
pub use probe::{DeviceProber, HostPaths};
