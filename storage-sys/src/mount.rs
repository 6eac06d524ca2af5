// SPDX-License-Identifier: GPL-3.0-only

//! mount(2) / umount2(2) primitives guarded by the mount table
//!
//! Every operation consults mount-info first so repeating a call is a no-op.

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};
use tokio_util::sync::CancellationToken;

use storage_types::MountInfo;

use crate::mountinfo::read_mount_entries;
use crate::{Result, SysError};

/// Splits option strings into kernel flags and filesystem data.
///
/// Options without a flag equivalent (e.g. `prjquota`) are passed to the filesystem.
pub fn parse_mount_options(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for option in options.iter().flat_map(|o| o.split(',')) {
        match option.trim() {
            "" | "defaults" => {}
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => flags &= !MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "dirsync" => flags |= MsFlags::MS_DIRSYNC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "strictatime" => flags |= MsFlags::MS_STRICTATIME,
            "lazytime" => flags |= MsFlags::MS_LAZYTIME,
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            other => data.push(other.to_string()),
        }
    }

    (flags, data.join(","))
}

async fn run_blocking<T, F>(cancel: &CancellationToken, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(op);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SysError::Cancelled),
        joined = task => joined.map_err(|e| SysError::Io(std::io::Error::other(e)))?,
    }
}

/// Mount primitives bound to one mount-info source
#[derive(Debug, Clone)]
pub struct Mounter {
    mountinfo: PathBuf,
}

impl Mounter {
    pub fn new(mountinfo: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo: mountinfo.into(),
        }
    }

    /// Mount records whose mount point is `target`, in kernel order
    pub fn mounts_at(&self, target: &str) -> Result<Vec<MountInfo>> {
        let target = normalize(target);
        Ok(read_mount_entries(&self.mountinfo)?
            .into_iter()
            .filter(|entry| normalize(&entry.mount_point) == target)
            .collect())
    }

    pub fn is_mounted(&self, target: &str) -> Result<bool> {
        Ok(!self.mounts_at(target)?.is_empty())
    }

    /// Mounts `device` on `target`, creating the directory.
    ///
    /// A no-op when `device` is already mounted there; fails when something else is.
    pub async fn mount(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(existing) = self.mounts_at(target)?.first() {
            if existing.source == device {
                tracing::debug!(device, target, "already mounted");
                return Ok(());
            }
            return Err(SysError::MountFailed(format!(
                "{target} is already mounted from {}",
                existing.source
            )));
        }

        let (flags, data) = parse_mount_options(options);
        let device = device.to_string();
        let target = target.to_string();
        let fs_type = fs_type.to_string();
        run_blocking(cancel, move || {
            std::fs::create_dir_all(&target)?;
            let data = (!data.is_empty()).then_some(data.as_str());
            nix::mount::mount(Some(device.as_str()), target.as_str(), Some(fs_type.as_str()), flags, data)
                .map_err(|errno| {
                    SysError::MountFailed(format!(
                        "mount {device} on {target} (type {fs_type}, flags {flags:?}): {errno}"
                    ))
                })
        })
        .await
    }

    /// Recursive bind mount; remounted read-only when requested.
    ///
    /// A no-op when `target` is already a mount point.
    pub async fn bind_mount(
        &self,
        source: &str,
        target: &str,
        read_only: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.is_mounted(target)? {
            tracing::debug!(source, target, "bind target already mounted");
            return Ok(());
        }

        let source = source.to_string();
        let target = target.to_string();
        run_blocking(cancel, move || {
            if !Path::new(&target).exists() {
                std::fs::create_dir_all(&target)?;
            }
            let bind = MsFlags::MS_BIND | MsFlags::MS_REC;
            nix::mount::mount(Some(source.as_str()), target.as_str(), None::<&str>, bind, None::<&str>)
                .map_err(|errno| {
                    SysError::MountFailed(format!("bind mount {source} on {target}: {errno}"))
                })?;

            if read_only {
                nix::mount::mount(
                    None::<&str>,
                    target.as_str(),
                    None::<&str>,
                    bind | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None::<&str>,
                )
                .map_err(|errno| {
                    SysError::MountFailed(format!("remount {target} read-only: {errno}"))
                })?;
            }
            Ok(())
        })
        .await
    }

    /// Unmounts `target` if it is a mount point, otherwise does nothing
    pub async fn unmount(&self, target: &str, cancel: &CancellationToken) -> Result<()> {
        if !self.is_mounted(target)? {
            return Ok(());
        }

        let target = target.to_string();
        run_blocking(cancel, move || {
            nix::mount::umount2(target.as_str(), MntFlags::UMOUNT_NOFOLLOW).map_err(|errno| {
                SysError::UnmountFailed(format!("umount {target}: {errno}"))
            })
        })
        .await
    }
}

fn normalize(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn mountinfo(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp mountinfo");
        file.write_all(contents.as_bytes()).expect("write mountinfo");
        file
    }

    #[test]
    fn translates_flags_and_keeps_filesystem_data() {
        let options = vec!["rw,noatime".to_string(), "prjquota".to_string(), "nodev".to_string()];
        let (flags, data) = parse_mount_options(&options);
        assert_eq!(flags, MsFlags::MS_NOATIME | MsFlags::MS_NODEV);
        assert_eq!(data, "prjquota");

        let (flags, data) = parse_mount_options(&["ro".to_string(), "rbind".to_string()]);
        assert_eq!(flags, MsFlags::MS_RDONLY | MsFlags::MS_BIND | MsFlags::MS_REC);
        assert!(data.is_empty());
    }

    #[test]
    fn finds_mounts_ignoring_trailing_slash() {
        let file = mountinfo(
            "41 22 8:16 / /var/lib/localdrive/mnt/abc rw,noatime - xfs /dev/sdb rw,prjquota\n",
        );
        let mounter = Mounter::new(file.path());
        assert!(mounter.is_mounted("/var/lib/localdrive/mnt/abc/").expect("lookup"));
        assert!(!mounter.is_mounted("/var/lib/localdrive/mnt").expect("lookup"));
    }

    #[tokio::test]
    async fn repeated_calls_are_noops() {
        let file = mountinfo(
            "41 22 8:16 / /mnt/abc rw,noatime - xfs /dev/sdb rw,prjquota\n\
             42 22 8:16 /vol /staging/vol rw - xfs /dev/sdb rw,prjquota\n",
        );
        let mounter = Mounter::new(file.path());
        let cancel = CancellationToken::new();

        mounter
            .mount("/dev/sdb", "/mnt/abc", "xfs", &[], &cancel)
            .await
            .expect("already mounted");
        mounter
            .bind_mount("/mnt/abc/vol", "/staging/vol", false, &cancel)
            .await
            .expect("already bound");
        mounter
            .unmount("/not/a/mount", &cancel)
            .await
            .expect("nothing to unmount");
    }

    #[tokio::test]
    async fn refuses_to_stack_a_different_device() {
        let file = mountinfo("41 22 8:32 / /mnt/abc rw - xfs /dev/sdc rw\n");
        let mounter = Mounter::new(file.path());
        let err = mounter
            .mount("/dev/sdb", "/mnt/abc", "xfs", &[], &CancellationToken::new())
            .await
            .expect_err("occupied target");
        assert!(matches!(err, SysError::MountFailed(_)));
    }
}
