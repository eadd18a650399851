//! portkeeper: start, stop, restart and health-check one process bound to
//! a TCP port on a single Unix host.
//!
//! Components, leaves first:
//! - [`probe`]: which processes listen on a port
//! - [`control`]: SIGTERM with a grace period, then SIGKILL
//! - [`pidfile`]: the on-disk pid record
//! - [`health`]: bounded readiness polling
//! - [`supervisor`]: the lifecycle operations built from the above

#[cfg(not(unix))]
compile_error!("portkeeper supports Unix targets only");

pub mod config;
pub mod control;
pub mod error;
pub mod health;
pub mod launch;
pub mod pidfile;
pub mod probe;
pub mod state_machine;
pub mod supervisor;

pub use config::{CommandSpec, OrphanPolicy, SupervisorConfig};
pub use control::{ProcessController, Termination};
pub use error::{Result, SupervisorError};
pub use launch::{DetachedLauncher, Launcher};
pub use pidfile::PidFile;
pub use probe::{PortProbe, SystemPortProbe};
pub use state_machine::State;
pub use supervisor::{StartReport, StatusReport, StopReport, Supervisor};
