/// Supervisor settings loaded from a YAML file at startup.
///
/// Settings are read once, validated, and treated as immutable for the
/// lifetime of the process; every run sees the same limits.
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::types::{Result, SandboxError};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_OUTPUT_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Wall-clock limit for a run, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Size of the writable output block device handed to the guest, in bytes.
    /// This bounds the worst-case output volume of a run.
    #[serde(default = "default_max_output_size")]
    pub max_output_size: u64,
    /// Memory given to the VM, passed through verbatim (e.g. "256M").
    #[serde(default = "default_instance_ram")]
    pub instance_ram: String,
    /// Absolute path holding the kernel, rootfs and initrd artifacts.
    pub sandbox_files_root: PathBuf,
    /// Optional file the debug log is appended to instead of stderr.
    #[serde(default)]
    pub debug_log_file: Option<PathBuf>,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_output_size() -> u64 {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_instance_ram() -> String {
    "256M".to_string()
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.timeout == 0 {
            return Err(SandboxError::Config(
                "timeout must be a positive number of seconds".to_string(),
            ));
        }
        if self.max_output_size == 0 {
            return Err(SandboxError::Config(
                "max_output_size must be a positive number of bytes".to_string(),
            ));
        }
        if self.instance_ram.is_empty() {
            return Err(SandboxError::Config(
                "instance_ram must not be empty".to_string(),
            ));
        }
        if !self.sandbox_files_root.is_absolute() {
            return Err(SandboxError::Config(format!(
                "sandbox_files_root must be an absolute path, got {}",
                self.sandbox_files_root.display()
            )));
        }
        Ok(())
    }
}

/// Load and validate settings from a YAML file.
pub fn load(path: &Path) -> Result<Settings> {
    let raw = fs::read_to_string(path).map_err(|e| {
        SandboxError::Config(format!("cannot read settings file {}: {}", path.display(), e))
    })?;
    let settings: Settings = serde_yaml::from_str(&raw).map_err(|e| {
        SandboxError::Config(format!("cannot parse settings file {}: {}", path.display(), e))
    })?;
    settings.validate()?;
    Ok(settings)
}
