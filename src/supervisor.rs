/// Process-group supervision primitive.
///
/// A run is executed by three cooperating OS processes:
///
/// ```text
/// caller
///   └► intermediate (I)   setsid(); owns the run's session/process group
///         ├► worker (W)   runs the worker action, execs into the VM
///         └► timer  (T)   closes its stdio, sleeps the timeout, exits
/// ```
///
/// The intermediate reaps whichever child finishes first. Worker first: the
/// timer is killed and reaped, and the worker's status is the run's status.
/// Timer first: the run timed out and the worker is still alive. Either way
/// the completion hook is invoked exactly once, inside the intermediate, and
/// afterwards the entire process group receives an unconditional SIGKILL.
/// The group kill runs on every completion path, not only on timeout, so
/// grandchildren spawned by the worker can never outlive the run. It takes
/// the intermediate down with it; by then the hook has already returned and
/// the caller only needs to reap.
use std::convert::Infallible;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, fork, getpid, setsid, ForkResult, Pid};

use crate::types::{Result, SandboxError, WorkerStatus};

/// Exit code of the worker when its setup or exec failed before the VM ran.
const WORKER_SETUP_EXIT: i32 = 126;

pub struct SupervisedProcess {
    timeout: Duration,
    intermediate: Option<Pid>,
}

impl SupervisedProcess {
    pub fn new(timeout_seconds: u64) -> Self {
        SupervisedProcess {
            timeout: Duration::from_secs(timeout_seconds),
            intermediate: None,
        }
    }

    /// Fork the intermediate and start a run.
    ///
    /// `worker` runs in a freshly forked child of the intermediate and is
    /// expected to replace its image (it only returns on setup failure).
    /// `hook` runs inside the intermediate once the run resolves; its context
    /// is captured by value, so nothing it touches is shared with the caller.
    ///
    /// Starting while a previous run has not been waited or killed is a hard
    /// error.
    pub fn start<W, H>(&mut self, worker: W, hook: H) -> Result<()>
    where
        W: FnOnce() -> Result<Infallible>,
        H: FnOnce(WorkerStatus),
    {
        self.try_reap();
        if self.intermediate.is_some() {
            return Err(SandboxError::Process(
                "supervised process already running; wait or kill it first".to_string(),
            ));
        }

        match unsafe { fork() }.map_err(|e| SandboxError::Process(format!("fork failed: {e}")))? {
            ForkResult::Parent { child } => {
                log::debug!("intermediate started with pid {}", child);
                self.intermediate = Some(child);
                Ok(())
            }
            ForkResult::Child => {
                let status = run_intermediate(self.timeout, worker);
                hook(status);
                // Sweep the whole group, ourselves included. Everything below
                // only runs if the kill itself failed.
                let _ = kill(Pid::from_raw(-getpid().as_raw()), Signal::SIGKILL);
                std::process::exit(0);
            }
        }
    }

    pub fn intermediate_pid(&self) -> Option<i32> {
        self.intermediate.map(Pid::as_raw)
    }

    /// Non-blocking liveness check; reaps the intermediate when it has exited.
    pub fn running(&mut self) -> bool {
        self.try_reap();
        self.intermediate.is_some()
    }

    /// Reap the intermediate. Non-blocking mode polls once and returns
    /// whether the run is over; blocking mode waits for it.
    pub fn wait(&mut self, blocking: bool) -> Result<bool> {
        let Some(pid) = self.intermediate else {
            return Ok(true);
        };
        let flags = if blocking {
            None
        } else {
            Some(WaitPidFlag::WNOHANG)
        };
        loop {
            match waitpid(pid, flags) {
                Ok(WaitStatus::StillAlive) => return Ok(false),
                Ok(_) => {
                    self.intermediate = None;
                    return Ok(true);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    self.intermediate = None;
                    return Ok(true);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Unconditionally kill the intermediate's whole process group, then
    /// block until it is reaped. Callers treat this as terminal: the hook may
    /// or may not have fired depending on timing.
    pub fn kill(&mut self) -> Result<()> {
        let Some(pid) = self.intermediate else {
            return Ok(());
        };
        // The group id equals the intermediate's pid once it called setsid;
        // also signal the pid directly to cover the window before that.
        match kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
        self.wait(true)?;
        // Sweep once more after the reap: children forked between the first
        // group kill and the intermediate's death would otherwise survive.
        // The group id outlives the leader while members remain.
        let _ = kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL);
        Ok(())
    }

    fn try_reap(&mut self) {
        if let Some(pid) = self.intermediate {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(_) | Err(Errno::ECHILD) => self.intermediate = None,
                Err(_) => {}
            }
        }
    }
}

/// Body of the intermediate: fork worker and timer, resolve the race.
fn run_intermediate<W>(timeout: Duration, worker: W) -> WorkerStatus
where
    W: FnOnce() -> Result<Infallible>,
{
    // Fresh session: group kills stay inside this subtree, and a panicking
    // guest that signals its whole group cannot reach the caller's terminal.
    if let Err(e) = setsid() {
        log::warn!("setsid failed in intermediate: {}", e);
    }

    let worker_pid = match unsafe { fork() } {
        Ok(ForkResult::Child) => match worker() {
            Ok(never) => match never {},
            Err(err) => {
                eprintln!("worker setup failed: {err}");
                std::process::exit(WORKER_SETUP_EXIT);
            }
        },
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            log::error!("fork(worker) failed: {}", e);
            return WorkerStatus::SpawnFailed;
        }
    };

    let timer_pid = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            for fd in 0..=2 {
                let _ = close(fd);
            }
            std::thread::sleep(timeout);
            std::process::exit(0);
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            log::error!("fork(timer) failed: {}", e);
            let _ = kill(worker_pid, Signal::SIGKILL);
            reap(worker_pid);
            return WorkerStatus::SpawnFailed;
        }
    };

    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, code)) if pid == worker_pid => {
                let _ = kill(timer_pid, Signal::SIGKILL);
                reap(timer_pid);
                return WorkerStatus::Exited(code);
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) if pid == worker_pid => {
                let _ = kill(timer_pid, Signal::SIGKILL);
                reap(timer_pid);
                return WorkerStatus::Signaled(signal as i32);
            }
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _))
                if pid == timer_pid =>
            {
                return WorkerStatus::TimedOut;
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                log::error!("waitpid in intermediate failed: {}", e);
                return WorkerStatus::SpawnFailed;
            }
        }
    }
}

/// Reap one child, riding out EINTR. Zombies are a defect on every path.
fn reap(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::StillAlive) => continue,
            Ok(_) | Err(Errno::ECHILD) => return,
            Err(Errno::EINTR) => continue,
            Err(_) => return,
        }
    }
}
