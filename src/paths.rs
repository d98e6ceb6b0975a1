/// Path resolution for sandbox artifacts and the per-run work area.
///
/// A pure value object: nothing here creates or deletes files. Callers decide
/// when directories are wiped or artifacts are opened.
use std::path::{Path, PathBuf};

use crate::types::{Result, SandboxError};

pub const KERNEL_FILE: &str = "linux.uml";
pub const ROOTFS_FILE: &str = "rootfs.squashfs";
pub const INITRD_FILE: &str = "initrd.img";

#[derive(Debug, Clone)]
pub struct Paths {
    /// UML kernel binary under the sandbox files root.
    pub kernel: PathBuf,
    /// Read-only root filesystem, attached copy-on-write.
    pub rootfs: PathBuf,
    /// Initial ramdisk.
    pub initrd: PathBuf,
    /// Per-run scratch directory under the install dir; wiped before each run.
    pub work_dir: PathBuf,
    /// Uploaded submission archive, spooled into the work dir at admission.
    pub input_tar: PathBuf,
    /// Pre-sized writable block device the guest writes its results into.
    pub output_tar: PathBuf,
    /// Combined VM console output (stdout + stderr).
    pub vm_log: PathBuf,
    /// Admission lock shared by supervisor instances on the same install dir.
    pub lock_file: PathBuf,
}

impl Paths {
    pub fn new(sandbox_root: &Path, install_dir: &Path) -> Self {
        let work_dir = install_dir.join("work");
        Paths {
            kernel: sandbox_root.join(KERNEL_FILE),
            rootfs: sandbox_root.join(ROOTFS_FILE),
            initrd: sandbox_root.join(INITRD_FILE),
            input_tar: work_dir.join("input.tar"),
            output_tar: work_dir.join("output.tar"),
            vm_log: work_dir.join("vm.log"),
            lock_file: install_dir.join("sandboxd.lock"),
            work_dir,
        }
    }

    /// Verify the immutable VM artifacts exist. Absence is startup-fatal.
    pub fn verify_artifacts(&self) -> Result<()> {
        for path in [&self.kernel, &self.rootfs, &self.initrd] {
            if !path.is_file() {
                return Err(SandboxError::Config(format!(
                    "required sandbox artifact missing: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}
