/// Single-entry reads from the guest's output archive.
///
/// The output container is a zero-filled block device image the guest writes
/// a tar into; the tar reader stops at the zero-block terminator, so the
/// unused tail of the pre-sized file is never scanned. A run that wrote
/// nothing leaves the file all zeros, which reads as an empty archive.
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::types::{Result, SandboxError};

/// Read one named entry from the archive. Missing file, unreadable archive,
/// or absent entry are all errors; callers decide whether that is fatal.
pub fn read_entry(archive_path: &Path, name: &str) -> Result<Vec<u8>> {
    let file = File::open(archive_path).map_err(|e| {
        SandboxError::Archive(format!("cannot open {}: {}", archive_path.display(), e))
    })?;
    let mut archive = tar::Archive::new(file);
    let entries = archive.entries().map_err(|e| {
        SandboxError::Archive(format!("cannot read {}: {}", archive_path.display(), e))
    })?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| SandboxError::Archive(format!("corrupt archive entry: {}", e)))?;
        let matches = match entry.path() {
            Ok(p) => {
                let wanted = Path::new(name);
                p.as_ref() == wanted
                    || p.strip_prefix(".").map(|s| s == wanted).unwrap_or(false)
            }
            Err(_) => false,
        };
        if !matches {
            continue;
        }
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| SandboxError::Archive(format!("cannot read entry {}: {}", name, e)))?;
        return Ok(data);
    }

    Err(SandboxError::Archive(format!(
        "entry {} not found in {}",
        name,
        archive_path.display()
    )))
}

/// Best-effort flavor: a missing or unreadable entry is an empty byte string.
pub fn read_entry_or_empty(archive_path: &Path, name: &str) -> Vec<u8> {
    match read_entry(archive_path, name) {
        Ok(data) => data,
        Err(err) => {
            log::debug!("optional entry {} unavailable: {}", name, err);
            Vec::new()
        }
    }
}
