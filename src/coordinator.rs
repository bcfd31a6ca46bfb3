//! Gate arbitrating foreground fetches and the prefetch thread
//!
//! Foreground callers never wait here: they bump counters and leave. The
//! single prefetch thread waits until prefetching has been triggered and no
//! foreground call is active, and polls for foreground activity that happened
//! since it last looked so it can drop stale predictions.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct GateState {
    trigger: bool,
    active_foreground: usize,
    pending_changes: usize,
    shutdown: bool,
}

/// Foreground/prefetch coordinator
#[derive(Debug, Default)]
pub struct PrefetchGate {
    state: Mutex<GateState>,
    clearance: Condvar,
    changes: Condvar,
}

impl PrefetchGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of a foreground fetch
    pub fn suspend_foreground(&self) {
        let mut state = self.state.lock();
        state.active_foreground += 1;
        state.trigger = true;
        state.pending_changes += 1;
        self.changes.notify_all();
    }

    /// Marks the end of a foreground fetch
    pub fn resume_foreground(&self) {
        let mut state = self.state.lock();
        state.active_foreground = state.active_foreground.saturating_sub(1);
        self.clearance.notify_all();
    }

    /// Suspends prefetching for the lifetime of the returned guard
    pub fn foreground(&self) -> ForegroundGuard<'_> {
        self.suspend_foreground();
        ForegroundGuard { gate: self }
    }

    /// Blocks until prefetching is triggered and no foreground call is active
    ///
    /// Returns `false` once the gate has been shut down.
    pub fn await_clearance(&self) -> bool {
        let mut state = self.state.lock();
        while !state.shutdown && (!state.trigger || state.active_foreground > 0) {
            self.clearance.wait(&mut state);
        }
        !state.shutdown
    }

    /// Whether foreground activity happened since the last consume
    pub fn has_pending_changes(&self) -> bool {
        self.state.lock().pending_changes > 0
    }

    /// Waits for at least one foreground event, then clears the count
    ///
    /// Returns `false` once the gate has been shut down.
    pub fn consume_pending_changes(&self) -> bool {
        let mut state = self.state.lock();
        while !state.shutdown && state.pending_changes == 0 {
            self.changes.wait(&mut state);
        }
        state.pending_changes = 0;
        !state.shutdown
    }

    /// Enables or disables prefetching altogether
    pub fn set_trigger(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.trigger = enabled;
        self.clearance.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.state.lock().trigger
    }

    pub fn active_foreground(&self) -> usize {
        self.state.lock().active_foreground
    }

    /// Releases the prefetch thread for good
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.clearance.notify_all();
        self.changes.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Lets a new prefetch thread wait on the gate after a shutdown
    pub fn reopen(&self) {
        self.state.lock().shutdown = false;
    }
}

/// Foreground activity marker, resumes the gate on drop
pub struct ForegroundGuard<'a> {
    gate: &'a PrefetchGate,
}

impl Drop for ForegroundGuard<'_> {
    fn drop(&mut self) {
        self.gate.resume_foreground();
    }
}
