//! Lifecycle of the managed process within one supervisor invocation.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    CmdStart,
    /// The child was spawned and has a pid.
    Spawned,
    /// The health check saw the port bound.
    Ready,
    /// The health check gave up, or the child died first.
    ReadyTimeout,
    CmdStop,
    /// Termination finished (`Stopped` or `AlreadyStopped`).
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SpawnProcess,
    RecordPid,
    AnnounceRunning,
    HandleOrphan,
    TerminateProcess,
    ClearRecord,
    Ignore,
}

#[derive(Debug, Default)]
pub struct Lifecycle {
    state: State,
}

impl Lifecycle {
    /// Start from an observed state rather than `Stopped`.
    pub fn observed(state: State) -> Self {
        Self { state }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    /// Apply `event`, returning what the caller must do next.
    pub fn step(&mut self, event: Event) -> Action {
        use Action::*;
        use State::*;

        let (next, action) = match (self.state, event) {
            // clean-slate start: a running occupant is displaced by the spawn path
            (Stopped | Running, Event::CmdStart) => (Starting, SpawnProcess),
            (Starting, Event::Spawned) => (Starting, RecordPid),
            (Starting, Event::Ready) => (Running, AnnounceRunning),
            (Starting, Event::ReadyTimeout) => (Stopped, HandleOrphan),
            (Stopped | Running, Event::CmdStop) => (Stopping, TerminateProcess),
            (Stopping, Event::Terminated) => (Stopped, ClearRecord),
            (state, event) => {
                log::warn!("ignoring {event:?} in state {state:?}");
                return Ignore;
            }
        };
        log::debug!("lifecycle {:?} --{event:?}--> {next:?}", self.state);
        self.state = next;
        action
    }
}
