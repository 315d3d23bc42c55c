//! Run lifecycle state machine.
//!
//! The transition table is explicit and total: every `(state, event)` pair
//! maps to a next state, and pairs that make no sense map to the current
//! state. Callers learn whether anything happened from
//! [`Transition::changed`] so side effects (a preemption notice, the final
//! upload) fire exactly once.
//!
//! [`RunLifecycle`] adds wall-clock bookkeeping on top of the table: time
//! spent paused is accumulated and excluded from [`RunLifecycle::elapsed_ms`].
//! Time is passed in explicitly (`now_ms`) so the logic stays deterministic.

use crate::interrupt::InterruptToken;
use crate::record::LifecycleSignal;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Paused,
    Preempting,
    Finished,
}

impl RunState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Preempting => write!(f, "preempting"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Pause,
    Resume,
    MarkPreempting,
    Finish { exit_code: i32 },
}

impl From<LifecycleSignal> for RunEvent {
    fn from(signal: LifecycleSignal) -> Self {
        match signal {
            LifecycleSignal::Pause => Self::Pause,
            LifecycleSignal::Resume => Self::Resume,
            LifecycleSignal::Preempting => Self::MarkPreempting,
            LifecycleSignal::Exit { exit_code } => Self::Finish { exit_code },
        }
    }
}

/// The transition table.
#[must_use]
pub const fn next_state(state: RunState, event: RunEvent) -> RunState {
    use RunState::{Finished, Paused, Preempting, Running};
    match (state, event) {
        (Running, RunEvent::Pause) => Paused,
        (Paused, RunEvent::Resume) => Running,
        (Running | Paused | Preempting, RunEvent::MarkPreempting) => Preempting,
        (Running | Paused | Preempting, RunEvent::Finish { .. }) => Finished,
        (state, _) => state,
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub event: RunEvent,
    /// False for no-op events.
    pub changed: bool,
}

/// State plus paused-time accounting for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLifecycle {
    state: RunState,
    started_at_ms: u64,
    paused_since_ms: Option<u64>,
    paused_total_ms: u64,
    finished_at_ms: Option<u64>,
    exit_code: Option<i32>,
}

impl RunLifecycle {
    #[must_use]
    pub const fn new(started_at_ms: u64) -> Self {
        Self {
            state: RunState::Running,
            started_at_ms,
            paused_since_ms: None,
            paused_total_ms: 0,
            finished_at_ms: None,
            exit_code: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    #[must_use]
    pub const fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn apply(&mut self, event: RunEvent, now_ms: u64) -> Transition {
        let from = self.state;
        let to = next_state(from, event);
        let changed = from != to;

        if changed {
            if from == RunState::Paused {
                if let Some(since) = self.paused_since_ms.take() {
                    self.paused_total_ms += now_ms.saturating_sub(since);
                }
            }
            if to == RunState::Paused {
                self.paused_since_ms = Some(now_ms);
            }
            if let (RunState::Finished, RunEvent::Finish { exit_code }) = (to, event) {
                self.exit_code = Some(exit_code);
                self.finished_at_ms = Some(now_ms);
            }
            self.state = to;
        }

        Transition {
            from,
            to,
            event,
            changed,
        }
    }

    /// Total paused time, including an ongoing pause.
    #[must_use]
    pub fn paused_ms(&self, now_ms: u64) -> u64 {
        let ongoing = self
            .paused_since_ms
            .map_or(0, |since| now_ms.saturating_sub(since));
        self.paused_total_ms + ongoing
    }

    /// Wall time since start minus paused time. Frozen once finished.
    #[must_use]
    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        let end = self.finished_at_ms.unwrap_or(now_ms);
        end.saturating_sub(self.started_at_ms)
            .saturating_sub(self.paused_ms(end))
    }
}

/// Outcome of [`SharedLifecycle::wait_while_paused`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseWait {
    /// The run is not paused (any more).
    Running,
    Finished,
    Interrupted,
    TimedOut,
}

/// A [`RunLifecycle`] shared between the log writer and run owners.
#[derive(Debug)]
pub struct SharedLifecycle {
    inner: Mutex<RunLifecycle>,
    changed: Condvar,
}

const WAIT_SLICE: Duration = Duration::from_millis(50);

impl SharedLifecycle {
    #[must_use]
    pub fn new(lifecycle: RunLifecycle) -> Self {
        Self {
            inner: Mutex::new(lifecycle),
            changed: Condvar::new(),
        }
    }

    pub fn apply(&self, event: RunEvent, now_ms: u64) -> Transition {
        let transition = self.inner.lock().apply(event, now_ms);
        if transition.changed {
            self.changed.notify_all();
        }
        transition
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.inner.lock().state()
    }

    #[must_use]
    pub fn snapshot(&self) -> RunLifecycle {
        self.inner.lock().clone()
    }

    /// Block while the run is paused.
    ///
    /// Wakes on any state change, when `token` is interrupted, or after
    /// `timeout`.
    pub fn wait_while_paused(&self, token: &InterruptToken, timeout: Duration) -> PauseWait {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock();
        loop {
            match guard.state() {
                RunState::Paused => {}
                RunState::Finished => return PauseWait::Finished,
                RunState::Running | RunState::Preempting => return PauseWait::Running,
            }
            if token.is_interrupted() {
                return PauseWait::Interrupted;
            }
            let now = Instant::now();
            if now >= deadline {
                return PauseWait::TimedOut;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            let _ = self.changed.wait_for(&mut guard, slice);
        }
    }
}
