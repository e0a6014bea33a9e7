use parking_lot::{Condvar, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use super::error::PauseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPhase {
    Running,
    PauseRequested,
    Paused,
}

#[derive(Debug)]
struct ControlState {
    requests: usize,
    phase: ControlPhase,
    stop: bool,
    finished: bool,
    owner: Option<ThreadId>,
}

/// Cooperative pause/resume control for a long-running thread.
///
/// Any number of callers may request a pause; the owning thread suspends at its next
/// [`PausableControl::safe_point`] and only continues once every requester has called
/// [`PausableControl::resume`]. A stop request wakes a paused thread and makes every
/// later safe point return `false`.
#[derive(Debug)]
pub struct PausableControl {
    state: Mutex<ControlState>,
    changed: Condvar,
}

impl Default for PausableControl {
    fn default() -> Self {
        Self::new()
    }
}

impl PausableControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                requests: 0,
                phase: ControlPhase::Running,
                stop: false,
                finished: false,
                owner: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Bind the calling thread as the owner. Called once at the top of the thread body.
    pub fn attach(&self) {
        let mut state = self.state.lock();
        state.owner = Some(std::thread::current().id());
        state.finished = false;
    }

    /// Ask the owning thread to pause at its next safe point.
    ///
    /// With `block_until_paused` the caller waits until the thread has actually reached
    /// the safe point (or exited). The owning thread may not block on itself.
    pub fn request_pause(&self, block_until_paused: bool) -> Result<(), PauseError> {
        let mut state = self.state.lock();
        if block_until_paused && state.owner == Some(std::thread::current().id()) {
            return Err(PauseError::SelfBlockingPause);
        }
        state.requests += 1;
        if state.phase == ControlPhase::Running {
            state.phase = ControlPhase::PauseRequested;
        }
        spdlog::trace!("Pause requested ({} outstanding)", state.requests);
        if block_until_paused {
            while state.phase != ControlPhase::Paused && !state.finished {
                self.changed.wait(&mut state);
            }
        }
        Ok(())
    }

    /// Withdraw one pause request. The thread only runs again when the count hits zero.
    pub fn resume(&self) -> Result<(), PauseError> {
        let mut state = self.state.lock();
        if state.requests == 0 {
            return Err(PauseError::NotPaused);
        }
        state.requests -= 1;
        if state.requests == 0 {
            // A request that never reached a safe point is simply withdrawn
            state.phase = ControlPhase::Running;
            self.changed.notify_all();
        }
        Ok(())
    }

    /// Called by the owning thread where nothing is half done.
    ///
    /// Returns `false` when the thread has been asked to stop and should leave its loop.
    pub fn safe_point(&self) -> bool {
        let mut state = self.state.lock();
        if state.stop {
            return false;
        }
        if state.requests > 0 {
            while state.requests > 0 && !state.stop {
                // A request made after a resume but before we woke sees PauseRequested
                if state.phase != ControlPhase::Paused {
                    state.phase = ControlPhase::Paused;
                    self.changed.notify_all();
                }
                self.changed.wait(&mut state);
            }
            state.phase = ControlPhase::Running;
        }
        !state.stop
    }

    pub fn request_stop(&self) {
        let mut state = self.state.lock();
        state.stop = true;
        self.changed.notify_all();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.state.lock().stop
    }

    /// Called by the owning thread as it exits so blocking pause requests return
    pub fn mark_finished(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        self.changed.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().phase == ControlPhase::Paused
    }

    pub fn phase(&self) -> ControlPhase {
        self.state.lock().phase
    }

    pub fn pause_requests(&self) -> usize {
        self.state.lock().requests
    }

    /// Wait until the thread is paused or has exited. Returns false on timeout.
    pub fn wait_until_paused(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.phase != ControlPhase::Paused && !state.finished {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.phase == ControlPhase::Paused || state.finished;
            }
        }
        true
    }
}
