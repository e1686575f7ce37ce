//! The counted callback gate.
//!
//! Kernel callbacks enter through [`CallbackGate::try_enter`]; shutdown
//! flips the gate closed and drains. Once `close` has returned, every
//! further `try_enter` fails until `open` is called again.

use std::{sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct GateState {
    closed: bool,
    inflight: usize,
}

#[derive(Debug, Default)]
struct GateInner {
    state: Mutex<GateState>,
    drained: Condvar,
}

/// A two-state (open/closed) gate with an inflight counter.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallbackGate(Arc<GateInner>);

impl CallbackGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the gate, or returns `None` while it is closed.
    pub fn try_enter(&self) -> Option<GatePass> {
        let mut state = self.0.state.lock();
        if state.closed {
            return None;
        }
        state.inflight += 1;
        Some(GatePass(self.0.clone()))
    }

    /// Refuses new entries and waits until the inflight counter reaches
    /// zero. Returns whether the gate drained within the timeout.
    pub fn close(&self, drain_timeout: Duration) -> bool {
        let mut state = self.0.state.lock();
        state.closed = true;
        let deadline = std::time::Instant::now() + drain_timeout;
        while state.inflight > 0 {
            if self
                .0
                .drained
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.inflight == 0;
            }
        }
        true
    }

    pub fn open(&self) {
        self.0.state.lock().closed = false;
    }

    pub fn inflight(&self) -> usize {
        self.0.state.lock().inflight
    }
}

/// Holds one slot in the gate; releases it on drop.
#[derive(Debug)]
pub(crate) struct GatePass(Arc<GateInner>);

impl Drop for GatePass {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.inflight -= 1;
        if state.inflight == 0 {
            self.0.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    #[test]
    fn entries_count_and_release() {
        let gate = CallbackGate::new();
        let a = gate.try_enter().unwrap();
        let b = gate.try_enter().unwrap();
        assert_eq!(gate.inflight(), 2);
        drop(a);
        drop(b);
        assert_eq!(gate.inflight(), 0);
    }

    #[test]
    fn closed_gate_refuses_until_reopened() {
        let gate = CallbackGate::new();
        assert!(gate.close(Duration::from_millis(10)));
        assert!(gate.try_enter().is_none());
        assert!(gate.try_enter().is_none());
        gate.open();
        assert!(gate.try_enter().is_some());
    }

    #[test]
    fn close_waits_for_inflight_work() {
        let gate = CallbackGate::new();
        let pass = gate.try_enter().unwrap();
        let worker = {
            let gate = gate.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                drop(pass);
                let _ = gate;
            })
        };
        assert!(gate.close(Duration::from_secs(5)));
        assert_eq!(gate.inflight(), 0);
        worker.join().unwrap();
    }

    #[test]
    fn close_times_out_with_stuck_entry() {
        let gate = CallbackGate::new();
        let _pass = gate.try_enter().unwrap();
        assert!(!gate.close(Duration::from_millis(50)));
    }
}
