//! Start/stop/restart/status orchestration for the managed process.
//!
//! Composes the port probe, the process controller, the pid file and the
//! launcher. Every operation runs to completion on the calling thread;
//! waits are bounded polls.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::Serialize;

use crate::config::{OrphanPolicy, SupervisorConfig};
use crate::control::{ProcessController, Termination};
use crate::error::{Result, SupervisorError};
use crate::health::{self, Readiness};
use crate::launch::{DetachedLauncher, Launcher};
use crate::pidfile::PidFile;
use crate::probe::{PortProbe, SystemPortProbe};
use crate::state_machine::{Action, Event, Lifecycle, State};

/// A confirmed start.
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub pid: u32,
    pub port: u16,
    /// Processes terminated to free the port first.
    pub displaced: Vec<u32>,
}

/// What `stop` did to each process it targeted.
#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub port: u16,
    pub terminated: Vec<(u32, Termination)>,
    /// False when the port was still bound once the settle wait ran out.
    pub port_released: bool,
}

impl StopReport {
    /// True if at least one target was alive when the stop began.
    pub fn was_running(&self) -> bool {
        self.terminated.iter().any(|(_, t)| *t == Termination::Stopped)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub name: String,
    pub port: u16,
    pub state: State,
    pub recorded_pid: Option<u32>,
    pub recorded_pid_alive: bool,
    pub port_owners: BTreeSet<u32>,
    pub pid_path: PathBuf,
    pub log_path: PathBuf,
}

impl StatusReport {
    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }
}

/// Top-level supervisor of one managed process.
pub struct Supervisor<P = SystemPortProbe, L = DetachedLauncher> {
    cfg: SupervisorConfig,
    probe: P,
    launcher: L,
    pid_file: PidFile,
    controller: ProcessController,
    lifecycle: Lifecycle,
}

impl Supervisor {
    /// Supervisor wired to the real OS probe and launcher.
    pub fn new(cfg: SupervisorConfig) -> Self {
        Self::with_parts(cfg, SystemPortProbe, DetachedLauncher)
    }
}

impl<P: PortProbe, L: Launcher> Supervisor<P, L> {
    pub fn with_parts(cfg: SupervisorConfig, probe: P, launcher: L) -> Self {
        let pid_file = PidFile::new(cfg.pid_path());
        let controller = ProcessController::new(cfg.poll_interval(), cfg.kill_confirm());
        Self {
            cfg,
            probe,
            launcher,
            pid_file,
            controller,
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.cfg
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    /// Inspect the pid record and the port, and sync the in-memory
    /// lifecycle with what is actually running.
    pub fn status(&mut self) -> Result<StatusReport> {
        let recorded_pid = self.pid_file.load();
        let recorded_pid_alive = recorded_pid.is_some_and(|pid| self.controller.is_alive(pid));
        if let Some(pid) = recorded_pid
            && !recorded_pid_alive
        {
            log::warn!("stale pid record: pid {pid} is not running");
        }
        let port_owners = self.probe.find_owners(self.cfg.port)?;

        let state = if recorded_pid_alive || !port_owners.is_empty() {
            State::Running
        } else {
            State::Stopped
        };
        self.lifecycle = Lifecycle::observed(state);

        Ok(StatusReport {
            name: self.cfg.name.clone(),
            port: self.cfg.port,
            state,
            recorded_pid,
            recorded_pid_alive,
            port_owners,
            pid_path: self.pid_file.path().to_path_buf(),
            log_path: self.cfg.log_path(),
        })
    }

    /// Free the port, spawn the command detached, record its pid and wait
    /// for it to bind the port.
    pub fn start(&mut self) -> Result<StartReport> {
        if self.lifecycle.step(Event::CmdStart) != Action::SpawnProcess {
            return Err(SupervisorError::InvalidTransition {
                op: "start",
                state: self.lifecycle.state(),
            });
        }

        let result = self.run_start();
        if result.is_err() && self.lifecycle.state() == State::Starting {
            self.lifecycle = Lifecycle::observed(State::Stopped);
        }
        result
    }

    fn run_start(&mut self) -> Result<StartReport> {
        let port = self.cfg.port;
        let displaced = self.clear_the_way()?;

        let log_path = self.cfg.log_path();
        let pid = self.launcher.launch(&self.cfg.command, &log_path)?;

        if self.lifecycle.step(Event::Spawned) == Action::RecordPid
            && let Err(e) = self.pid_file.save(pid)
        {
            // An untracked child cannot be stopped later; take it down now.
            log::error!("cannot record pid {pid}, terminating it: {e}");
            if let Err(kill_err) = self.controller.terminate(pid, self.cfg.grace_period()) {
                log::error!("failed to terminate untracked pid {pid}: {kill_err}");
            }
            return Err(e.into());
        }

        log::info!(
            "waiting up to {} ms for pid {pid} to listen on port {port}",
            self.cfg.health_timeout_ms
        );
        let readiness = health::wait_for_child(
            &self.probe,
            port,
            pid,
            &self.controller,
            self.cfg.health_timeout(),
            self.cfg.health_poll_interval(),
        )?;

        match readiness {
            Readiness::Listening => {
                self.lifecycle.step(Event::Ready);
                log::info!("{} is listening on port {port} (pid {pid})", self.cfg.name);
                Ok(StartReport {
                    pid,
                    port,
                    displaced,
                })
            }
            Readiness::Exited => {
                self.lifecycle.step(Event::ReadyTimeout);
                log::error!(
                    "pid {pid} exited before listening; see {}",
                    log_path.display()
                );
                self.pid_file.clear()?;
                Err(SupervisorError::ChildExited { pid, port })
            }
            Readiness::TimedOut => {
                if self.lifecycle.step(Event::ReadyTimeout) == Action::HandleOrphan {
                    self.handle_orphan(pid)?;
                }
                Err(SupervisorError::HealthCheckTimeout {
                    pid,
                    port,
                    waited_ms: self.cfg.health_timeout_ms,
                })
            }
        }
    }

    /// Terminate the recorded process (or, without a live record, whatever
    /// owns the port) and clear the record.
    pub fn stop(&mut self) -> Result<StopReport> {
        let before = self.lifecycle.state();
        if self.lifecycle.step(Event::CmdStop) != Action::TerminateProcess {
            return Err(SupervisorError::InvalidTransition {
                op: "stop",
                state: self.lifecycle.state(),
            });
        }

        let result = self.run_stop();
        if result.is_err() && self.lifecycle.state() == State::Stopping {
            self.lifecycle = Lifecycle::observed(before);
        }
        result
    }

    fn run_stop(&mut self) -> Result<StopReport> {
        let port = self.cfg.port;
        let targets = self.stop_targets()?;
        let mut report = StopReport {
            port,
            terminated: Vec::with_capacity(targets.len()),
            port_released: true,
        };

        for pid in targets {
            let outcome = match self.controller.terminate(pid, self.cfg.grace_period()) {
                Ok(Termination::StillRunning) => Err(SupervisorError::StillRunning(pid)),
                Ok(outcome) => Ok(outcome),
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(outcome) => report.terminated.push((pid, outcome)),
                Err(e) => {
                    // the record is kept so the operator can retry
                    if !report.terminated.is_empty() {
                        log::warn!(
                            "stop aborted at pid {pid}; already handled: {:?}",
                            report.terminated
                        );
                    }
                    return Err(e);
                }
            }
        }

        if self.lifecycle.step(Event::Terminated) == Action::ClearRecord {
            self.pid_file.clear()?;
        }

        if report.was_running()
            && let Err(e) = self.settle(port)
        {
            log::warn!("{e}");
            report.port_released = false;
        }
        Ok(report)
    }

    /// `stop` followed by `start`; the outcome is the start's.
    pub fn restart(&mut self) -> Result<StartReport> {
        if let Err(e) = self.stop() {
            log::warn!("stop during restart failed, continuing with start: {e}");
        }
        self.start()
    }

    /// Pids `stop` should terminate: the live recorded pid, else the
    /// current port owners.
    fn stop_targets(&self) -> Result<Vec<u32>> {
        match self.pid_file.load() {
            Some(pid) if self.controller.is_alive(pid) => return Ok(vec![pid]),
            Some(pid) => {
                log::warn!("stale pid record: pid {pid} is not running, checking port instead");
            }
            None => log::debug!("no pid record at {}", self.pid_file.path().display()),
        }
        let owners = self.probe.find_owners(self.cfg.port)?;
        if !owners.is_empty() {
            log::info!("port {} is held by {owners:?}", self.cfg.port);
        }
        Ok(owners.into_iter().collect())
    }

    /// Terminate every current port owner plus any live recorded pid, then
    /// wait for the port to free up.
    fn clear_the_way(&mut self) -> Result<Vec<u32>> {
        let port = self.cfg.port;
        let mut targets = self.probe.find_owners(port)?;
        let recorded = self.pid_file.load();
        if let Some(pid) = recorded
            && self.controller.is_alive(pid)
        {
            targets.insert(pid);
        }

        let mut displaced = Vec::new();
        for pid in targets {
            log::info!("terminating pid {pid} to free port {port}");
            match self.controller.terminate(pid, self.cfg.grace_period())? {
                Termination::Stopped => displaced.push(pid),
                Termination::AlreadyStopped => {}
                Termination::StillRunning => return Err(SupervisorError::StillRunning(pid)),
            }
        }
        if recorded.is_some() {
            self.pid_file.clear()?;
        }

        if !displaced.is_empty() {
            self.settle(port)?;
        }
        Ok(displaced)
    }

    /// Wait for `port` to be released after a termination.
    fn settle(&self, port: u16) -> Result<()> {
        let free = health::wait_until_free(
            &self.probe,
            port,
            self.cfg.settle_timeout(),
            self.cfg.poll_interval(),
        )?;
        if free {
            return Ok(());
        }
        let owners = self.probe.find_owners(port)?;
        Err(SupervisorError::PortStillBound { port, owners })
    }

    fn handle_orphan(&mut self, pid: u32) -> Result<()> {
        match self.cfg.on_health_timeout {
            OrphanPolicy::LeaveRunning => {
                log::warn!(
                    "pid {pid} did not bind port {} in time; leaving it running (pid recorded in {})",
                    self.cfg.port,
                    self.pid_file.path().display()
                );
                Ok(())
            }
            OrphanPolicy::Terminate => {
                log::warn!(
                    "pid {pid} did not bind port {} in time; terminating it",
                    self.cfg.port
                );
                match self.controller.terminate(pid, self.cfg.grace_period())? {
                    Termination::StillRunning => Err(SupervisorError::StillRunning(pid)),
                    Termination::Stopped | Termination::AlreadyStopped => {
                        self.pid_file.clear()?;
                        Ok(())
                    }
                }
            }
        }
    }
}
