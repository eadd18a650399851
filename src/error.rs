//! Error types for the supervisor components.
//!
//! Each component has its own error so callers can tell a failed port
//! query from a failed signal; `SupervisorError` wraps them for the
//! lifecycle operations.

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;

use crate::state_machine::State;

/// Result alias for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// The port-ownership lookup itself failed.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("port {port} is bound but its owner is not visible (insufficient privileges?)")]
    OwnerNotVisible { port: u16 },

    #[error("port lookup utility not found: {0}")]
    ToolMissing(String),

    #[error("port lookup command failed: {0}")]
    Command(String),
}

/// A termination signal could not be delivered for a reason other than
/// the target being gone.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("refusing to signal invalid pid {0}")]
    InvalidPid(u32),

    #[error("failed to send {signal} to pid {pid}: {errno}")]
    Delivery {
        pid: u32,
        signal: &'static str,
        errno: nix::errno::Errno,
    },
}

/// The PID record could not be written or removed.
#[derive(Error, Debug)]
#[error("failed to {op} pid file {path}: {source}")]
pub struct PidFileError {
    pub op: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// The child process could not be spawned.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize default config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not determine config directory")]
    NoConfigDir,

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors surfaced by `Supervisor` operations.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    PortQuery(#[from] ProbeError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("pid {pid} did not bind port {port} within {waited_ms} ms")]
    HealthCheckTimeout { pid: u32, port: u16, waited_ms: u64 },

    #[error("pid {pid} exited before binding port {port}")]
    ChildExited { pid: u32, port: u16 },

    #[error("pid {0} is still running after SIGKILL")]
    StillRunning(u32),

    #[error("port {port} is still bound by {owners:?}")]
    PortStillBound { port: u16, owners: BTreeSet<u32> },

    #[error("cannot {op} while {state:?}")]
    InvalidTransition { op: &'static str, state: State },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_errors_name_their_cause_once() {
        let err = SupervisorError::from(ProbeError::OwnerNotVisible { port: 7080 });
        let rendered = format!("{:#}", anyhow::Error::from(err).context("stop failed"));
        assert_eq!(rendered.matches("not visible").count(), 1, "{rendered}");

        let err = SupervisorError::from(SignalError::InvalidPid(0));
        let rendered = format!("{:#}", anyhow::Error::from(err));
        assert_eq!(rendered, "refusing to signal invalid pid 0");
    }
}
