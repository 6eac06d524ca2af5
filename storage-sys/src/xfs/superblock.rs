// SPDX-License-Identifier: GPL-3.0-only

//! XFS primary superblock reader
//!
//! Only the leading, fixed-layout part of `struct xfs_dsb` is decoded. All fields are
//! big-endian.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use storage_types::FsInfo;

use crate::{Result, SysError};

pub const XFS_MAGIC: u32 = 0x5846_5342;
/// Bytes of the superblock decoded here
pub const SUPERBLOCK_LEN: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub block_size: u32,
    pub data_blocks: u64,
    pub rt_blocks: u64,
    pub rt_extents: u64,
    pub uuid: [u8; 16],
    pub log_start: u64,
    pub root_ino: u64,
    pub rbm_ino: u64,
    pub rsum_ino: u64,
    pub rt_ext_size: u32,
    pub ag_blocks: u32,
    pub ag_count: u32,
    pub rbm_blocks: u32,
    pub log_blocks: u32,
    pub version: u16,
    pub sector_size: u16,
    pub inode_size: u16,
    pub inodes_per_block: u16,
    pub fname: [u8; 12],
    pub block_log: u8,
    pub sector_log: u8,
    pub inode_log: u8,
    pub inodes_per_block_log: u8,
    pub ag_block_log: u8,
    pub rt_extents_log: u8,
    pub in_progress: u8,
    pub imax_pct: u8,
    pub inode_count: u64,
    pub inode_free: u64,
    pub free_data_blocks: u64,
    pub free_rt_extents: u64,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_be_bytes(self.take())
    }
}

/// Decodes a superblock from the first bytes of a device.
///
/// A wrong magic number is `NoFilesystem`; a correct magic with a truncated buffer is a
/// parse error.
pub fn parse_superblock(buf: &[u8]) -> Result<Superblock> {
    if buf.len() < 4 || u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) != XFS_MAGIC {
        return Err(SysError::NoFilesystem("xfs magic not found".to_string()));
    }
    if buf.len() < SUPERBLOCK_LEN {
        return Err(SysError::Parse(format!(
            "xfs superblock truncated: {} of {SUPERBLOCK_LEN} bytes",
            buf.len()
        )));
    }

    let mut c = Cursor { buf, pos: 0 };
    let sb = Superblock {
        magic: c.u32(),
        block_size: c.u32(),
        data_blocks: c.u64(),
        rt_blocks: c.u64(),
        rt_extents: c.u64(),
        uuid: c.take(),
        log_start: c.u64(),
        root_ino: c.u64(),
        rbm_ino: c.u64(),
        rsum_ino: c.u64(),
        rt_ext_size: c.u32(),
        ag_blocks: c.u32(),
        ag_count: c.u32(),
        rbm_blocks: c.u32(),
        log_blocks: c.u32(),
        version: c.u16(),
        sector_size: c.u16(),
        inode_size: c.u16(),
        inodes_per_block: c.u16(),
        fname: c.take(),
        block_log: c.u8(),
        sector_log: c.u8(),
        inode_log: c.u8(),
        inodes_per_block_log: c.u8(),
        ag_block_log: c.u8(),
        rt_extents_log: c.u8(),
        in_progress: c.u8(),
        imax_pct: c.u8(),
        inode_count: c.u64(),
        inode_free: c.u64(),
        free_data_blocks: c.u64(),
        free_rt_extents: c.u64(),
    };

    if sb.block_size == 0 {
        return Err(SysError::Parse("xfs superblock has zero block size".to_string()));
    }

    Ok(sb)
}

impl Superblock {
    pub fn fs_uuid(&self) -> String {
        Uuid::from_bytes(self.uuid).hyphenated().to_string()
    }

    pub fn label(&self) -> String {
        let end = self.fname.iter().position(|b| *b == 0).unwrap_or(self.fname.len());
        String::from_utf8_lossy(&self.fname[..end]).into_owned()
    }

    pub fn fs_info(&self) -> FsInfo {
        let block_size = u64::from(self.block_size);
        FsInfo {
            fs_uuid: self.fs_uuid(),
            fs_type: "xfs".to_string(),
            label: self.label(),
            block_size,
            total_bytes: self.data_blocks.saturating_mul(block_size),
            free_bytes: self.free_data_blocks.saturating_mul(block_size),
        }
    }
}

/// Blocking read of the superblock at offset 0 of `path`
pub fn read_superblock(path: &Path) -> Result<Superblock> {
    let file = File::open(path)?;
    let mut buf = Vec::with_capacity(SUPERBLOCK_LEN);
    file.take(SUPERBLOCK_LEN as u64).read_to_end(&mut buf)?;
    parse_superblock(&buf).map_err(|err| match err {
        SysError::NoFilesystem(_) => SysError::NoFilesystem(path.display().to_string()),
        other => other,
    })
}

/// Probes `path` for an XFS filesystem.
///
/// The read runs on the blocking pool. If `cancel` fires first the call returns
/// `Cancelled` and the read is left to finish in the background.
pub async fn probe(path: &Path, cancel: &CancellationToken) -> Result<FsInfo> {
    let path: PathBuf = path.to_path_buf();
    let read = tokio::task::spawn_blocking(move || read_superblock(&path));

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SysError::Cancelled),
        joined = read => {
            let sb = joined.map_err(|e| SysError::Io(std::io::Error::other(e)))??;
            Ok(sb.fs_info())
        }
    }
}

/// Builds the leading superblock bytes for tests and fixtures
pub fn encode_superblock(uuid: &Uuid, block_size: u32, data_blocks: u64, free_blocks: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(512);
    buf.extend_from_slice(&XFS_MAGIC.to_be_bytes());
    buf.extend_from_slice(&block_size.to_be_bytes());
    buf.extend_from_slice(&data_blocks.to_be_bytes());
    buf.extend_from_slice(&[0u8; 16]); // rblocks, rextents
    buf.extend_from_slice(uuid.as_bytes());
    buf.extend_from_slice(&[0u8; 32]); // logstart, rootino, rbmino, rsumino
    buf.extend_from_slice(&[0u8; 20]); // rextsize .. logblocks
    buf.extend_from_slice(&[0u8; 8]); // versionnum .. inopblock
    let mut fname = [0u8; 12];
    fname[..10].copy_from_slice(b"LOCALDRIVE");
    buf.extend_from_slice(&fname);
    buf.extend_from_slice(&[0u8; 8]); // log sizes, inprogress, imax_pct
    buf.extend_from_slice(&[0u8; 16]); // icount, ifree
    buf.extend_from_slice(&free_blocks.to_be_bytes());
    buf.extend_from_slice(&[0u8; 8]); // frextents
    buf.resize(512, 0);
    buf
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const FS_UUID: &str = "d79dff9e-2884-46f2-8919-dada2eecb12d";

    #[test]
    fn decodes_identity_and_capacity() {
        let uuid = Uuid::parse_str(FS_UUID).expect("uuid");
        let buf = encode_superblock(&uuid, 4096, 1_310_720, 1_300_000);

        let sb = parse_superblock(&buf).expect("parse superblock");
        assert_eq!(sb.magic, XFS_MAGIC);
        let info = sb.fs_info();
        assert_eq!(info.fs_uuid, FS_UUID);
        assert_eq!(info.fs_type, "xfs");
        assert_eq!(info.label, "LOCALDRIVE");
        assert_eq!(info.block_size, 4096);
        assert_eq!(info.total_bytes, 5_368_709_120);
        assert_eq!(info.free_bytes, 1_300_000 * 4096);
    }

    #[test]
    fn wrong_magic_is_no_filesystem() {
        let mut buf = encode_superblock(&Uuid::nil(), 4096, 1, 1);
        buf[0] = 0xEF;
        assert!(matches!(parse_superblock(&buf), Err(SysError::NoFilesystem(_))));
        assert!(matches!(parse_superblock(&[]), Err(SysError::NoFilesystem(_))));
    }

    #[test]
    fn truncated_superblock_is_parse_error() {
        let buf = encode_superblock(&Uuid::nil(), 4096, 1, 1);
        assert!(matches!(parse_superblock(&buf[..64]), Err(SysError::Parse(_))));
    }

    #[tokio::test]
    async fn probes_image_file() {
        let uuid = Uuid::parse_str(FS_UUID).expect("uuid");
        let mut image = tempfile::NamedTempFile::new().expect("temp image");
        image
            .write_all(&encode_superblock(&uuid, 4096, 4096, 100))
            .expect("write superblock");

        let info = probe(image.path(), &CancellationToken::new())
            .await
            .expect("probe");
        assert_eq!(info.fs_uuid, FS_UUID);
        assert_eq!(info.total_bytes, 4096 * 4096);
    }

    #[tokio::test]
    async fn probe_of_blank_image_reports_path() {
        let image = tempfile::NamedTempFile::new().expect("temp image");
        let err = probe(image.path(), &CancellationToken::new())
            .await
            .expect_err("blank image");
        match err {
            SysError::NoFilesystem(path) => assert_eq!(path, image.path().display().to_string()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_probe_returns_promptly() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = probe(Path::new("/dev/null"), &cancel).await.expect_err("cancelled");
        assert!(matches!(err, SysError::Cancelled));
    }
}
