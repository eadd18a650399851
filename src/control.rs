//! Process termination with graceful-then-forced escalation.
//!
//! `terminate` sends SIGTERM, polls liveness for the grace period, then
//! sends SIGKILL. When the target leads its own process group (children
//! started by the supervisor call `setsid`) the whole group is signalled,
//! and the termination only counts as done once no member of the group is
//! left, so worker processes go down with their parent.

use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, getpgid};
use serde::Serialize;

use crate::error::SignalError;

/// Result of a termination attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The process was alive and is now gone.
    Stopped,
    /// The process was already gone before any signal was sent.
    AlreadyStopped,
    /// SIGKILL was sent but the process is still visible.
    StillRunning,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessController {
    poll_interval: Duration,
    kill_confirm: Duration,
}

impl Default for ProcessController {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(2))
    }
}

impl ProcessController {
    pub fn new(poll_interval: Duration, kill_confirm: Duration) -> Self {
        Self {
            poll_interval,
            kill_confirm,
        }
    }

    /// Check if `pid` names a live process.
    ///
    /// Reaps it first if it is our own exited child, so a zombie left by
    /// this process does not count as alive.
    pub fn is_alive(&self, pid: u32) -> bool {
        let Some(nix_pid) = to_pid(pid) else {
            return false;
        };

        match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return true,
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => return false,
            // ECHILD: not our child, fall through to the signal probe
            Ok(_) | Err(_) => {}
        }

        match signal::kill(nix_pid, None::<Signal>) {
            Ok(()) => !is_zombie(pid),
            Err(Errno::ESRCH) => false,
            // exists but belongs to someone else
            Err(Errno::EPERM) => true,
            Err(e) => {
                log::warn!("liveness probe for pid {pid} failed: {e}");
                true
            }
        }
    }

    /// Terminate `pid`: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// SIGKILL is never sent before `grace` has elapsed.
    pub fn terminate(&self, pid: u32, grace: Duration) -> Result<Termination, SignalError> {
        let nix_pid = to_pid(pid).ok_or(SignalError::InvalidPid(pid))?;

        if !self.is_alive(pid) {
            log::debug!("pid {pid} is not running");
            return Ok(Termination::AlreadyStopped);
        }

        let group = leads_own_group(nix_pid);
        log::info!(
            "sending SIGTERM to {} {pid}",
            if group { "process group" } else { "pid" }
        );
        let target = Target { pid, nix_pid, group };
        match send(nix_pid, Signal::SIGTERM, group) {
            Ok(()) => {}
            Err(SignalError::Delivery {
                errno: Errno::ESRCH,
                ..
            }) => return Ok(Termination::AlreadyStopped),
            Err(e) => return Err(e),
        }

        if self.wait_for_exit(&target, grace) {
            log::info!("pid {pid} exited after SIGTERM");
            return Ok(Termination::Stopped);
        }

        log::warn!(
            "{} {pid} still running after {} ms grace period, sending SIGKILL",
            if group { "process group" } else { "pid" },
            grace.as_millis()
        );
        match send(nix_pid, Signal::SIGKILL, group) {
            Ok(()) => {}
            Err(SignalError::Delivery {
                errno: Errno::ESRCH,
                ..
            }) => return Ok(Termination::Stopped),
            Err(e) => return Err(e),
        }

        if self.wait_for_exit(&target, self.kill_confirm) {
            Ok(Termination::Stopped)
        } else {
            log::error!("pid {pid} survived SIGKILL for {} ms", self.kill_confirm.as_millis());
            Ok(Termination::StillRunning)
        }
    }

    /// Poll liveness until the target is gone or `timeout` elapses.
    fn wait_for_exit(&self, target: &Target, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_gone(target) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn is_gone(&self, target: &Target) -> bool {
        // always probe the leader so an exited child of ours gets reaped
        let leader_alive = self.is_alive(target.pid);
        if target.group {
            !leader_alive && !group_alive(target.nix_pid)
        } else {
            !leader_alive
        }
    }
}

/// What `terminate` signals: a single pid, or the group it leads.
struct Target {
    pid: u32,
    nix_pid: Pid,
    group: bool,
}

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// True when `pid` is the leader of its own process group.
fn leads_own_group(pid: Pid) -> bool {
    getpgid(Some(pid)).is_ok_and(|pgid| pgid == pid)
}

fn send(pid: Pid, sig: Signal, group: bool) -> Result<(), SignalError> {
    let res = if group {
        signal::killpg(pid, sig)
    } else {
        signal::kill(pid, sig)
    };
    res.map_err(|errno| SignalError::Delivery {
        pid: pid.as_raw() as u32,
        signal: sig.as_str(),
        errno,
    })
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Zombies still answer `kill(pid, 0)`; procfs tells them apart.
        fn is_zombie(pid: u32) -> bool {
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|stat| parse_stat(&stat))
                .is_some_and(|(state, _)| is_dead_state(state))
        }

        /// True while any non-zombie process is in group `pgid`.
        ///
        /// `killpg(pgid, 0)` also succeeds for zombie members that nobody
        /// has reaped yet, so scan procfs instead.
        fn group_alive(pgid: Pid) -> bool {
            let entries = match std::fs::read_dir("/proc") {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!("cannot scan /proc for group {pgid}: {e}");
                    return signal_group(pgid);
                }
            };
            entries
                .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u32>().ok())
                .filter_map(|pid| std::fs::read_to_string(format!("/proc/{pid}/stat")).ok())
                .filter_map(|stat| parse_stat(&stat))
                .any(|(state, pgrp)| pgrp == pgid.as_raw() && !is_dead_state(state))
        }

        fn is_dead_state(state: char) -> bool {
            state == 'Z' || state == 'X'
        }

        /// State and process group fields of `/proc/<pid>/stat`; the comm
        /// field may contain spaces and parentheses, so split on the last `)`.
        fn parse_stat(stat: &str) -> Option<(char, i32)> {
            let (_, rest) = stat.rsplit_once(')')?;
            let mut fields = rest.split_whitespace();
            let state = fields.next()?.chars().next()?;
            let pgrp = fields.nth(1)?.parse().ok()?;
            Some((state, pgrp))
        }
    } else {
        fn is_zombie(_pid: u32) -> bool {
            false
        }

        fn group_alive(pgid: Pid) -> bool {
            signal_group(pgid)
        }
    }
}

/// Null-signal probe of a whole process group.
fn signal_group(pgid: Pid) -> bool {
    match signal::killpg(pgid, None::<Signal>) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) => true,
        Err(e) => {
            log::warn!("liveness probe for process group {pgid} failed: {e}");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn controller() -> ProcessController {
        ProcessController::new(Duration::from_millis(20), Duration::from_secs(2))
    }

    fn spawn(script: &str) -> u32 {
        Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
            .id()
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(controller().is_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pids() {
        let c = controller();
        assert!(!c.is_alive(0));
        assert!(matches!(
            c.terminate(0, Duration::ZERO),
            Err(SignalError::InvalidPid(0))
        ));
        assert!(matches!(
            c.terminate(u32::MAX, Duration::ZERO),
            Err(SignalError::InvalidPid(_))
        ));
    }

    #[test]
    fn test_terminate_cooperative_process() {
        let c = controller();
        let pid = spawn("exec sleep 30");
        assert!(c.is_alive(pid));

        let started = Instant::now();
        assert_eq!(c.terminate(pid, Duration::from_secs(5)).unwrap(), Termination::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!c.is_alive(pid));

        // second attempt finds nothing to do
        assert_eq!(
            c.terminate(pid, Duration::from_secs(5)).unwrap(),
            Termination::AlreadyStopped
        );
    }

    #[test]
    fn test_terminate_escalates_after_grace() {
        let c = controller();
        // ignore SIGTERM; the sleep child inherits the ignored disposition
        let pid = spawn("trap '' TERM; sleep 30; sleep 30");
        // give the shell time to install the trap
        thread::sleep(Duration::from_millis(200));

        let grace = Duration::from_millis(400);
        let started = Instant::now();
        assert_eq!(c.terminate(pid, grace).unwrap(), Termination::Stopped);
        assert!(started.elapsed() >= grace);
        assert!(!c.is_alive(pid));
    }

    #[test]
    fn test_terminate_waits_for_whole_group() {
        use std::os::unix::process::CommandExt;

        let dir = tempfile::tempdir().unwrap();
        let worker_file = dir.path().join("worker.pid");
        // the leader dies on SIGTERM, its worker ignores it
        let script = format!(
            "(trap '' TERM; exec sleep 30) & echo $! > {}; wait",
            worker_file.display()
        );
        let leader = Command::new("sh")
            .args(["-c", &script])
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
            .id();

        let deadline = Instant::now() + Duration::from_secs(5);
        let worker = loop {
            if let Some(pid) = std::fs::read_to_string(&worker_file)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
            {
                break pid;
            }
            assert!(Instant::now() < deadline, "worker never started");
            thread::sleep(Duration::from_millis(20));
        };
        // let the worker exec into sleep with SIGTERM ignored
        thread::sleep(Duration::from_millis(200));

        let c = controller();
        let grace = Duration::from_millis(400);
        let started = Instant::now();
        assert_eq!(c.terminate(leader, grace).unwrap(), Termination::Stopped);
        assert!(started.elapsed() >= grace);
        assert!(!c.is_alive(leader));
        assert!(!c.is_alive(worker));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_parse_stat() {
        assert_eq!(parse_stat("123 (sleep) S 1 123 3"), Some(('S', 123)));
        assert_eq!(parse_stat("123 (a) b) Z 1 77 3"), Some(('Z', 77)));
        assert_eq!(parse_stat("123 (sleep) S"), None);
        assert_eq!(parse_stat("garbage"), None);
    }
}
