/// Admission control for submissions.
///
/// Every request is handled under an exclusive `flock` on a lock file in the
/// install directory, so two supervisor instances sharing an install cannot
/// both admit a run. Within the lock the decision table is:
///
/// | request                  | response      | HTTP |
/// |--------------------------|---------------|------|
/// | non-POST                 | `not_found`   | 404  |
/// | POST without `file`      | `bad_request` | 500  |
/// | POST while a run is live | `busy`        | 500  |
/// | POST, idle, with `file`  | `ok`          | 200  |
/// | anything else going wrong| `error`       | 500  |
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::notify::Notifier;
use crate::runner::Runner;
use crate::types::{Result, SandboxError};

/// Decoded submission fields the gate decides on. HTTP parsing and multipart
/// decoding happen upstream; the gate never sees raw request bytes.
#[derive(Debug, Default)]
pub struct Submission {
    /// Spooled upload; `None` when the request carried no `file` field.
    pub archive: Option<PathBuf>,
    pub notify: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Ok,
    Busy,
    BadRequest,
    NotFound,
    Error,
}

impl GateStatus {
    pub fn http_code(self) -> u16 {
        match self {
            GateStatus::Ok => 200,
            GateStatus::NotFound => 404,
            GateStatus::Busy | GateStatus::BadRequest | GateStatus::Error => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            GateStatus::Ok => "OK",
            GateStatus::NotFound => "Not Found",
            GateStatus::Busy | GateStatus::BadRequest | GateStatus::Error => {
                "Internal Server Error"
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GateStatus::Ok => "ok",
            GateStatus::Busy => "busy",
            GateStatus::BadRequest => "bad_request",
            GateStatus::NotFound => "not_found",
            GateStatus::Error => "error",
        }
    }

    pub fn body(self) -> String {
        serde_json::json!({ "status": self.as_str() }).to_string()
    }
}

pub struct RequestGate {
    runner: Runner,
    lock_path: PathBuf,
}

impl RequestGate {
    pub fn new(runner: Runner, lock_path: PathBuf) -> Self {
        RequestGate { runner, lock_path }
    }

    /// Decide one request. Never returns an error: every failure maps to a
    /// response status, and the file lock is released on every path by the
    /// guard's drop.
    pub fn handle(&mut self, method: &str, submission: &Submission) -> GateStatus {
        let _lock = match RequestLock::acquire(&self.lock_path) {
            Ok(guard) => guard,
            Err(err) => {
                log::error!("cannot acquire admission lock: {}", err);
                return GateStatus::Error;
            }
        };
        self.admit(method, submission)
    }

    fn admit(&mut self, method: &str, submission: &Submission) -> GateStatus {
        if method != "POST" {
            return GateStatus::NotFound;
        }
        let Some(archive) = submission.archive.as_deref() else {
            return GateStatus::BadRequest;
        };
        if self.runner.busy() {
            return GateStatus::Busy;
        }

        let notifier = submission.notify.as_ref().map(|url| {
            Notifier::new(
                url.clone(),
                submission.token.clone().unwrap_or_default(),
            )
        });

        match self.runner.start(archive, notifier) {
            Ok(()) => GateStatus::Ok,
            Err(SandboxError::Busy) => GateStatus::Busy,
            Err(err) => {
                log::error!("failed to start run: {}", err);
                GateStatus::Error
            }
        }
    }

}

/// Exclusive request lock. The lock file is created once and never removed;
/// deleting it would let a second instance lock a fresh inode and race us.
struct RequestLock {
    file: File,
}

impl RequestLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| SandboxError::Lock(format!("open {}: {}", path.display(), e)))?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(SandboxError::Lock(format!(
                "flock {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(RequestLock { file })
    }
}

impl Drop for RequestLock {
    fn drop(&mut self) {
        // Unlock explicitly rather than relying on close: a freshly forked
        // intermediate inherits this open description, and the lock must not
        // stay held for the whole run it supervises.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
