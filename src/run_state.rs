//! Run state shared between a long running operation and its controller
//!
//! The state is a pair of atomic flags: `is_running` is owned by the worker that
//! starts the operation and `should_stop` by whoever requests a cooperative stop.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[derive(Debug, Default)]
pub struct RunState {
    is_running: AtomicBool,
    should_stop: AtomicBool,
}

/// Main loop run state
pub type LoopRunState = RunState;
/// Per-cavity scan run state
pub type LocalScanRunState = RunState;

impl RunState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
    /// Marks the operation as running and clears any previous stop request
    ///
    /// Returns `false` if the operation is already running.
    pub fn try_start(&self) -> bool {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.should_stop.store(false, Ordering::Release);
        true
    }
    /// Marks the operation as finished
    pub fn finish(&self) {
        self.is_running.store(false, Ordering::Release);
    }
    /// Requests a cooperative stop, returns `true` if the operation was running
    pub fn request_stop(&self) -> bool {
        self.should_stop.store(true, Ordering::Release);
        self.is_running()
    }
    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }
    /// Starts the operation and returns a guard that marks it finished when dropped
    pub fn start(self: &Arc<Self>) -> Option<RunGuard> {
        self.try_start().then(|| RunGuard(Arc::clone(self)))
    }
}

/// Marks the run state as finished on drop
#[derive(Debug)]
pub struct RunGuard(Arc<RunState>);
impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let state = LoopRunState::new();
        {
            let _guard = state.start().unwrap();
            assert!(state.is_running());
            assert!(state.start().is_none());
            assert!(state.request_stop());
            assert!(state.should_stop());
        }
        assert!(!state.is_running());
        assert!(state.should_stop());
        let _guard = state.start().unwrap();
        assert!(!state.should_stop());
    }

    #[test]
    fn stop_from_another_thread() {
        let state = LocalScanRunState::new();
        let _guard = state.start().unwrap();
        let remote = Arc::clone(&state);
        std::thread::spawn(move || remote.request_stop())
            .join()
            .unwrap();
        assert!(state.should_stop());
    }
}
