/// Run ownership: work-area preparation, VM launch, result classification.
use std::convert::Infallible;
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::unistd::{close, dup2, execv};

use crate::archive;
use crate::config::Settings;
use crate::notify::Notifier;
use crate::paths::Paths;
use crate::supervisor::SupervisedProcess;
use crate::types::{CapturedOutputs, Result, RunOutcome, RunStatus, SandboxError, WorkerStatus};

pub const EXIT_CODE_ENTRY: &str = "exit_code.txt";
pub const TEST_OUTPUT_ENTRY: &str = "test_output.txt";
pub const STDOUT_ENTRY: &str = "stdout.txt";
pub const STDERR_ENTRY: &str = "stderr.txt";

pub struct Runner {
    settings: Settings,
    paths: Paths,
    process: SupervisedProcess,
}

impl Runner {
    /// The work directory is wiped at construction so a crashed previous
    /// supervisor cannot leak stale artifacts into the first run.
    pub fn new(settings: Settings, paths: Paths) -> Result<Self> {
        nuke_work_dir(&paths)?;
        let process = SupervisedProcess::new(settings.timeout);
        Ok(Runner {
            settings,
            paths,
            process,
        })
    }

    pub fn busy(&mut self) -> bool {
        self.process.running()
    }

    pub fn intermediate_pid(&self) -> Option<i32> {
        self.process.intermediate_pid()
    }

    /// Admit one run: wipe the work area, spool the uploaded archive into it,
    /// and hand the VM to the supervision primitive. Returns as soon as the
    /// intermediate is forked; classification and notification happen in the
    /// completion hook.
    pub fn start(&mut self, archive_file: &Path, notifier: Option<Notifier>) -> Result<()> {
        if self.busy() {
            return Err(SandboxError::Busy);
        }

        nuke_work_dir(&self.paths)?;
        fs::copy(archive_file, &self.paths.input_tar)?;

        let settings = self.settings.clone();
        let paths = self.paths.clone();
        let context = RunContext {
            paths: self.paths.clone(),
            notifier,
        };
        self.process.start(
            move || vm_worker(&settings, &paths),
            move |status| context.complete(status),
        )
    }

    pub fn wait(&mut self, blocking: bool) -> Result<bool> {
        self.process.wait(blocking)
    }

    pub fn kill(&mut self) -> Result<()> {
        self.process.kill()
    }
}

/// Recursively remove the work directory and recreate it empty. Runs before
/// every run so no artifact of a previous run can leak into the next.
pub fn nuke_work_dir(paths: &Paths) -> Result<()> {
    match fs::remove_dir_all(&paths.work_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::create_dir_all(&paths.work_dir)?;
    Ok(())
}

/// Worker body: runs in the forked worker process and execs into the VM.
/// Only returns on setup failure, which the caller turns into a non-zero
/// exit (classified as a failed run).
fn vm_worker(settings: &Settings, paths: &Paths) -> Result<Infallible> {
    // Console goes to the log file; stdin is closed, the guest has no use
    // for it (con=null on the VM side).
    let log_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&paths.vm_log)?;
    dup2(log_file.as_raw_fd(), libc::STDOUT_FILENO)?;
    dup2(log_file.as_raw_fd(), libc::STDERR_FILENO)?;
    let _ = close(libc::STDIN_FILENO);

    // Pre-size the output block device so the guest can never write more
    // than max_output_size bytes of results.
    let output = File::create(&paths.output_tar)?;
    output.set_len(settings.max_output_size)?;
    drop(output);

    let argv = vm_argv(settings, paths)?;
    execv(&argv[0], &argv).map_err(|e| {
        SandboxError::Process(format!("execv {}: {}", paths.kernel.display(), e))
    })
}

/// Build the VM argv. The kernel is exec'd directly with this vector, no
/// shell ever parses it.
fn vm_argv(settings: &Settings, paths: &Paths) -> Result<Vec<CString>> {
    let args = [
        paths.kernel.as_os_str().as_bytes().to_vec(),
        format!("initrd={}", paths.initrd.display()).into_bytes(),
        format!("ubdarc={}", paths.rootfs.display()).into_bytes(),
        format!("ubdbr={}", paths.input_tar.display()).into_bytes(),
        format!("ubdc={}", paths.output_tar.display()).into_bytes(),
        format!("mem={}", settings.instance_ram).into_bytes(),
        b"con=null".to_vec(),
    ];
    args.into_iter()
        .map(|arg| {
            CString::new(arg)
                .map_err(|_| SandboxError::Config("VM argument contains NUL byte".to_string()))
        })
        .collect()
}

/// Per-run context moved into the intermediate; `complete` is the completion
/// hook and fires exactly once per started run.
struct RunContext {
    paths: Paths,
    notifier: Option<Notifier>,
}

impl RunContext {
    fn complete(self, worker: WorkerStatus) {
        let outcome = self.collect_outcome(worker);
        log::info!(
            "run complete: status={} exit_code={:?}",
            outcome.status.as_str(),
            outcome.exit_code
        );
        if let Some(notifier) = &self.notifier {
            notifier.send_notification(&outcome);
        }
    }

    fn collect_outcome(&self, worker: WorkerStatus) -> RunOutcome {
        let (status, exit_code) = match worker {
            WorkerStatus::TimedOut => (RunStatus::Timeout, None),
            WorkerStatus::Exited(0) => {
                match archive::read_entry(&self.paths.output_tar, EXIT_CODE_ENTRY) {
                    Ok(bytes) => classify_inner_exit(&bytes),
                    Err(err) => {
                        log::warn!("no inner exit code after clean VM exit: {}", err);
                        (RunStatus::Failed, None)
                    }
                }
            }
            WorkerStatus::Exited(code) => {
                log::warn!("VM exited with status {}", code);
                (RunStatus::Failed, None)
            }
            WorkerStatus::Signaled(signal) => {
                log::warn!("VM killed by signal {}", signal);
                (RunStatus::Failed, None)
            }
            WorkerStatus::SpawnFailed => (RunStatus::Failed, None),
        };

        let outputs = CapturedOutputs {
            test_output: archive::read_entry_or_empty(&self.paths.output_tar, TEST_OUTPUT_ENTRY),
            stdout: archive::read_entry_or_empty(&self.paths.output_tar, STDOUT_ENTRY),
            stderr: archive::read_entry_or_empty(&self.paths.output_tar, STDERR_ENTRY),
        };

        RunOutcome {
            status,
            exit_code,
            outputs,
        }
    }
}

/// Map the guest-reported exit code to a run status. The guest wrote the
/// file, so it gets no benefit of the doubt: anything unparseable is a
/// failure with the code omitted.
pub fn classify_inner_exit(bytes: &[u8]) -> (RunStatus, Option<i32>) {
    let parsed = std::str::from_utf8(bytes)
        .ok()
        .map(str::trim)
        .and_then(|s| s.parse::<i32>().ok());
    match parsed {
        Some(0) => (RunStatus::Finished, Some(0)),
        Some(code) => (RunStatus::Failed, Some(code)),
        None => (RunStatus::Failed, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inner_exit_zero_is_finished() {
        assert_eq!(classify_inner_exit(b"0"), (RunStatus::Finished, Some(0)));
        assert_eq!(classify_inner_exit(b"0\n"), (RunStatus::Finished, Some(0)));
    }

    #[test]
    fn inner_exit_nonzero_is_failed_with_code() {
        assert_eq!(classify_inner_exit(b"3\n"), (RunStatus::Failed, Some(3)));
        assert_eq!(classify_inner_exit(b"-1"), (RunStatus::Failed, Some(-1)));
    }

    #[test]
    fn unparseable_inner_exit_is_failed_without_code() {
        assert_eq!(classify_inner_exit(b""), (RunStatus::Failed, None));
        assert_eq!(classify_inner_exit(b"ok\n"), (RunStatus::Failed, None));
        assert_eq!(classify_inner_exit(&[0xff, 0xfe]), (RunStatus::Failed, None));
    }

    #[test]
    fn nuke_work_dir_clears_previous_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let install = tempfile::tempdir().unwrap();
        let paths = Paths::new(root.path(), install.path());

        nuke_work_dir(&paths).unwrap();
        std::fs::write(&paths.output_tar, b"stale").unwrap();
        std::fs::create_dir(paths.work_dir.join("debris")).unwrap();

        nuke_work_dir(&paths).unwrap();
        assert!(paths.work_dir.is_dir());
        assert_eq!(std::fs::read_dir(&paths.work_dir).unwrap().count(), 0);
    }

    #[test]
    fn vm_argv_wires_block_devices_in_order() {
        let settings = Settings {
            timeout: 10,
            max_output_size: 1024,
            instance_ram: "512M".to_string(),
            sandbox_files_root: "/srv/sandbox".into(),
            debug_log_file: None,
        };
        let paths = Paths::new(Path::new("/srv/sandbox"), Path::new("/opt/sandboxd"));
        let argv = vm_argv(&settings, &paths).unwrap();
        let argv: Vec<&str> = argv.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            argv,
            vec![
                "/srv/sandbox/linux.uml",
                "initrd=/srv/sandbox/initrd.img",
                "ubdarc=/srv/sandbox/rootfs.squashfs",
                "ubdbr=/opt/sandboxd/work/input.tar",
                "ubdc=/opt/sandboxd/work/output.tar",
                "mem=512M",
                "con=null",
            ]
        );
    }
}
