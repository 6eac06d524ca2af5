// SPDX-License-Identifier: GPL-3.0-only

use std::fs::File;
use std::path::Path;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use storage_types::MIN_SUPPORTED_DEVICE_SIZE;

use crate::command::run;
use crate::mount::Mounter;
use crate::{Result, SysError};

/// Filesystem label written on every formatted drive
pub const FS_LABEL: &str = "LOCALDRIVE";

pub fn mkfs_args(device: &str, fs_uuid: &str, force: bool, reflink: bool) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        "maxpct=50".to_string(),
        "-m".to_string(),
        format!("uuid={fs_uuid}"),
    ];
    if force {
        args.push("-f".to_string());
    }
    args.extend([
        "-m".to_string(),
        format!("reflink={}", u8::from(reflink)),
        "-L".to_string(),
        FS_LABEL.to_string(),
        device.to_string(),
    ]);
    args
}

pub async fn format(
    device: &str,
    fs_uuid: &str,
    force: bool,
    reflink: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let args = mkfs_args(device, fs_uuid, force, reflink);
    match run("mkfs.xfs", &args, cancel).await {
        Ok(_) => Ok(()),
        Err(SysError::CommandFailed { command, stderr }) => Err(SysError::FormatFailed(format!(
            "{command}: {stderr}"
        ))),
        Err(err) => Err(err),
    }
}

/// Detects whether this host can mount XFS with reflink enabled.
///
/// Formats a temporary backing file with reflink on, attaches it to a loop device and
/// mounts it; on mount failure retries with reflink off. The backing file, loop device and
/// mount are released before returning.
pub async fn probe_reflink_support(mounter: &Mounter, cancel: &CancellationToken) -> Result<bool> {
    let workdir = tempfile::tempdir()?;
    let image = workdir.path().join("reflink.img");
    File::create(&image)?.set_len(MIN_SUPPORTED_DEVICE_SIZE)?;
    let target = workdir.path().join("mnt");

    for reflink in [true, false] {
        match try_mount_image(mounter, &image, &target, reflink, cancel).await {
            Ok(()) => {
                tracing::info!(reflink, "xfs reflink probe succeeded");
                return Ok(reflink);
            }
            Err(SysError::Cancelled) => return Err(SysError::Cancelled),
            Err(err) => tracing::warn!(reflink, "xfs reflink probe failed: {err}"),
        }
    }

    Err(SysError::FormatFailed(
        "unable to mount a probe filesystem with or without reflink".to_string(),
    ))
}

async fn try_mount_image(
    mounter: &Mounter,
    image: &Path,
    target: &Path,
    reflink: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let image = image.display().to_string();
    let target = target.display().to_string();
    let fs_uuid = Uuid::new_v4().to_string();
    format(&image, &fs_uuid, true, reflink, cancel).await?;

    let loop_device = run(
        "losetup",
        &["--find".to_string(), "--show".to_string(), image],
        cancel,
    )
    .await?
    .trim()
    .to_string();

    let mounted = mounter.mount(&loop_device, &target, "xfs", &[], cancel).await;
    let cleanup = CancellationToken::new();
    if mounted.is_ok() {
        if let Err(err) = mounter.unmount(&target, &cleanup).await {
            tracing::warn!("unable to unmount reflink probe at {target}: {err}");
        }
    }
    if let Err(err) = run("losetup", &["-d".to_string(), loop_device.clone()], &cleanup).await {
        tracing::warn!("unable to detach loop device {loop_device}: {err}");
    }

    mounted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_mkfs_arguments() {
        let args = mkfs_args("/dev/sdb", "d79dff9e-2884-46f2-8919-dada2eecb12d", false, true);
        assert_eq!(
            args.join(" "),
            "-i maxpct=50 -m uuid=d79dff9e-2884-46f2-8919-dada2eecb12d -m reflink=1 -L LOCALDRIVE /dev/sdb"
        );

        let args = mkfs_args("/dev/sdb", "u", true, false);
        assert_eq!(args.join(" "), "-i maxpct=50 -m uuid=u -f -m reflink=0 -L LOCALDRIVE /dev/sdb");
    }
}
