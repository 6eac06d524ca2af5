use std::fs::File;
use std::path::Path;

use tempfile::TempDir;

use crate::cmd::run;
use crate::errors::{Result, TestingError};

/// Sparse backing file attached to a free loop device; detached on drop.
#[derive(Debug)]
pub struct LoopDevice {
    path: String,
    _workdir: TempDir,
}

impl LoopDevice {
    pub fn attach(size_bytes: u64) -> Result<Self> {
        if unsafe { libc::geteuid() } != 0 {
            return Err(TestingError::PrivilegeRequired);
        }

        let workdir = tempfile::tempdir()?;
        let image = workdir.path().join("disk.img");
        File::create(&image)?.set_len(size_bytes)?;

        let path = run(
            "losetup",
            &[
                "--find".to_string(),
                "--show".to_string(),
                image.display().to_string(),
            ],
        )?
        .trim()
        .to_string();

        Ok(Self {
            path,
            _workdir: workdir,
        })
    }

    /// Device node, e.g. `/dev/loop7`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Kernel name, e.g. `loop7`
    pub fn name(&self) -> &str {
        Path::new(&self.path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.path)
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if let Err(error) = run("losetup", &["-d".to_string(), self.path.clone()]) {
            eprintln!("WARN detach {}: {}", self.path, error);
        }
    }
}
