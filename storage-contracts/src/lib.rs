// SPDX-License-Identifier: GPL-3.0-only

pub mod cancel;
pub mod protocol;
pub mod traits;

pub use cancel::with_cancel;
pub use protocol::{AgentError, ErrorKind, Result};
pub use traits::{
    DeviceProbe, DriveRegistry, FilesystemOps, MountOps, Registry, VolumeRegistry, WatchEvent,
    list_all,
};
