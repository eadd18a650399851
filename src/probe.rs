//! Port ownership lookup.
//!
//! Answers "which processes are listening on TCP port N" from the OS
//! socket tables. The answer is never cached: ownership can change
//! between any two calls.
//! - Linux: `/proc/net/tcp{,6}` joined with `/proc/<pid>/fd`
//! - macOS and other Unix: `lsof`

use std::collections::BTreeSet;

use crate::error::ProbeError;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux_probe;
        use linux_probe as platform;
    } else if #[cfg(unix)] {
        mod lsof_probe;
        use lsof_probe as platform;
    }
}

/// Source of port-to-process bindings.
pub trait PortProbe {
    /// Pids of every process listening on `port`. Empty when the port is
    /// free; that is the normal case, not an error.
    fn find_owners(&self, port: u16) -> Result<BTreeSet<u32>, ProbeError>;
}

/// Probe backed by the operating system's socket tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortProbe;

impl PortProbe for SystemPortProbe {
    fn find_owners(&self, port: u16) -> Result<BTreeSet<u32>, ProbeError> {
        let owners = platform::find_owners(port)?;
        log::debug!("port {port} owners: {owners:?}");
        Ok(owners)
    }
}

impl<P: PortProbe + ?Sized> PortProbe for &P {
    fn find_owners(&self, port: u16) -> Result<BTreeSet<u32>, ProbeError> {
        (**self).find_owners(port)
    }
}
