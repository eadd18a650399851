//! Readiness polling against the port probe.
//!
//! Every wait is a bounded loop: check, sleep `min(poll, remaining)`,
//! repeat until the condition holds or the deadline passes. None of them
//! blocks longer than `timeout + poll`.

use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::control::ProcessController;
use crate::error::ProbeError;
use crate::probe::PortProbe;

/// Outcome of waiting for a freshly spawned child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// The port is bound.
    Listening,
    /// The deadline passed with the port still free.
    TimedOut,
    /// The child died before the port was bound.
    Exited,
}

/// Poll until `port` has an owner. Returns whether it did in time.
pub fn wait_until_listening<P: PortProbe>(
    probe: &P,
    port: u16,
    timeout: Duration,
    poll: Duration,
) -> Result<bool, ProbeError> {
    poll_until(timeout, poll, || Ok(!probe.find_owners(port)?.is_empty()))
}

/// Poll until `port` is free. Used after a stop, before the port is reused.
pub fn wait_until_free<P: PortProbe>(
    probe: &P,
    port: u16,
    timeout: Duration,
    poll: Duration,
) -> Result<bool, ProbeError> {
    poll_until(timeout, poll, || Ok(probe.find_owners(port)?.is_empty()))
}

/// Like [`wait_until_listening`], but gives up early if `pid` dies.
///
/// Any owner counts as ready: the child may hand the socket to a worker
/// process it forks.
pub fn wait_for_child<P: PortProbe>(
    probe: &P,
    port: u16,
    pid: u32,
    controller: &ProcessController,
    timeout: Duration,
    poll: Duration,
) -> Result<Readiness, ProbeError> {
    let deadline = Instant::now() + timeout;
    loop {
        if !probe.find_owners(port)?.is_empty() {
            return Ok(Readiness::Listening);
        }
        if !controller.is_alive(pid) {
            return Ok(Readiness::Exited);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(Readiness::TimedOut);
        }
        thread::sleep(poll.min(deadline - now));
    }
}

fn poll_until(
    timeout: Duration,
    poll: Duration,
    mut check: impl FnMut() -> Result<bool, ProbeError>,
) -> Result<bool, ProbeError> {
    let deadline = Instant::now() + timeout;
    loop {
        if check()? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        thread::sleep(poll.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::BTreeSet;

    /// Reports the port as bound from the `bind_after`-th query onward.
    struct CountingProbe {
        calls: Cell<u32>,
        bind_after: Option<u32>,
    }

    impl CountingProbe {
        fn new(bind_after: Option<u32>) -> Self {
            Self {
                calls: Cell::new(0),
                bind_after,
            }
        }
    }

    impl PortProbe for CountingProbe {
        fn find_owners(&self, _port: u16) -> Result<BTreeSet<u32>, ProbeError> {
            let n = self.calls.get() + 1;
            self.calls.set(n);
            Ok(match self.bind_after {
                Some(after) if n >= after => BTreeSet::from([4242]),
                _ => BTreeSet::new(),
            })
        }
    }

    struct FailingProbe;

    impl PortProbe for FailingProbe {
        fn find_owners(&self, port: u16) -> Result<BTreeSet<u32>, ProbeError> {
            Err(ProbeError::OwnerNotVisible { port })
        }
    }

    #[test]
    fn test_listening_immediately() {
        let probe = CountingProbe::new(Some(1));
        let started = Instant::now();
        assert!(wait_until_listening(&probe, 7080, Duration::from_secs(5), Duration::from_secs(1)).unwrap());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(probe.calls.get(), 1);
    }

    #[test]
    fn test_listening_after_a_few_polls() {
        let probe = CountingProbe::new(Some(4));
        assert!(
            wait_until_listening(&probe, 7080, Duration::from_secs(5), Duration::from_millis(10)).unwrap()
        );
        assert_eq!(probe.calls.get(), 4);
    }

    #[test]
    fn test_timeout_is_bounded() {
        let probe = CountingProbe::new(None);
        let timeout = Duration::from_millis(200);
        let poll = Duration::from_millis(50);
        let started = Instant::now();
        assert!(!wait_until_listening(&probe, 7080, timeout, poll).unwrap());
        let elapsed = started.elapsed();
        assert!(elapsed >= timeout);
        // generous slack for a loaded CI box
        assert!(elapsed < timeout + poll + Duration::from_millis(500), "{elapsed:?}");
    }

    #[test]
    fn test_zero_timeout_checks_once() {
        let probe = CountingProbe::new(None);
        assert!(!wait_until_listening(&probe, 7080, Duration::ZERO, Duration::from_secs(1)).unwrap());
        assert_eq!(probe.calls.get(), 1);
    }

    #[test]
    fn test_probe_errors_propagate() {
        let err = wait_until_listening(&FailingProbe, 7080, Duration::from_secs(1), Duration::from_millis(10));
        assert!(matches!(err, Err(ProbeError::OwnerNotVisible { port: 7080 })));
    }

    #[test]
    fn test_wait_until_free() {
        // bound on every call: never frees
        let probe = CountingProbe::new(Some(1));
        assert!(!wait_until_free(&probe, 7080, Duration::from_millis(50), Duration::from_millis(10)).unwrap());
        let probe = CountingProbe::new(None);
        assert!(wait_until_free(&probe, 7080, Duration::from_millis(50), Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_wait_for_child_detects_exit() {
        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        let probe = CountingProbe::new(None);
        let controller = ProcessController::new(Duration::from_millis(10), Duration::from_secs(1));
        let started = Instant::now();
        let readiness =
            wait_for_child(&probe, 7080, pid, &controller, Duration::from_secs(10), Duration::from_millis(20))
                .unwrap();
        assert_eq!(readiness, Readiness::Exited);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_for_child_listening() {
        let probe = CountingProbe::new(Some(2));
        let controller = ProcessController::default();
        let readiness = wait_for_child(
            &probe,
            7080,
            std::process::id(),
            &controller,
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .unwrap();
        assert_eq!(readiness, Readiness::Listening);
    }
}
