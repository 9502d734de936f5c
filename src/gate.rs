//! Frame gate.
//!
//! The gate is open iff no hold is active. Holds are independent: pausing
//! while a confirmation is pending and then resuming leaves the gate closed
//! until the confirmation is resolved too. `TornDown` is permanent.
//!
//! `forward` runs the engine call with the gate lock held, so once `close`
//! returns no further frame can reach the engine. Every transition into the
//! closed state bumps `generation`; a controller compares the generation an
//! outcome was produced under with the current one and discards stale work.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GateHold {
    /// Host paused the flow (app backgrounded, dialog on screen).
    Paused,
    /// A captured face or a terminal tip awaits a user decision.
    Confirming,
    /// The session released its device.
    TornDown,
}

#[derive(Debug, Default)]
struct GateState {
    holds: BTreeSet<GateHold>,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct FrameGate {
    state: Mutex<GateState>,
}

impl FrameGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // A panic inside an engine call poisons the lock; the gate state itself
        // is still consistent, so keep using it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_open(&self) -> bool {
        self.lock().holds.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn holds(&self) -> Vec<GateHold> {
        self.lock().holds.iter().copied().collect()
    }

    /// Add a hold. Returns true when this call moved the gate from open to closed.
    pub fn close(&self, hold: GateHold) -> bool {
        let mut state = self.lock();
        let was_open = state.holds.is_empty();
        state.holds.insert(hold);
        if was_open {
            state.generation += 1;
            log::debug!("frame gate closed by {:?} (gen {})", hold, state.generation);
        }
        was_open
    }

    /// Remove a hold. Returns true when the gate is open afterwards.
    /// `TornDown` is never lifted.
    pub fn open(&self, hold: GateHold) -> bool {
        let mut state = self.lock();
        if hold == GateHold::TornDown {
            return state.holds.is_empty();
        }
        state.holds.remove(&hold);
        let open = state.holds.is_empty();
        if open {
            log::debug!("frame gate reopened (gen {})", state.generation);
        }
        open
    }

    /// Run `f` if the gate is open, holding the gate lock for the duration.
    /// Returns the generation the call ran under together with its output.
    pub fn forward<T>(&self, f: impl FnOnce() -> T) -> Option<(u64, T)> {
        let state = self.lock();
        if !state.holds.is_empty() {
            return None;
        }
        let generation = state.generation;
        let out = f();
        drop(state);
        Some((generation, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_open_and_forwards() {
        let gate = FrameGate::new();
        assert!(gate.is_open());
        assert_eq!(gate.forward(|| 5), Some((0, 5)));
    }

    #[test]
    fn closed_gate_does_not_run_callback() {
        let gate = FrameGate::new();
        gate.close(GateHold::Paused);
        let mut ran = false;
        assert!(gate.forward(|| ran = true).is_none());
        assert!(!ran);
    }

    #[test]
    fn holds_are_independent() {
        let gate = FrameGate::new();
        assert!(gate.close(GateHold::Confirming));
        assert!(!gate.close(GateHold::Paused));
        assert!(!gate.open(GateHold::Paused));
        assert!(!gate.is_open());
        assert!(gate.open(GateHold::Confirming));
        assert!(gate.is_open());
    }

    #[test]
    fn torn_down_is_permanent() {
        let gate = FrameGate::new();
        gate.close(GateHold::TornDown);
        assert!(!gate.open(GateHold::TornDown));
        assert!(!gate.open(GateHold::Paused));
        assert!(!gate.is_open());
    }

    #[test]
    fn generation_bumps_on_each_closure() {
        let gate = FrameGate::new();
        gate.close(GateHold::Paused);
        gate.close(GateHold::Confirming);
        assert_eq!(gate.generation(), 1);
        gate.open(GateHold::Paused);
        gate.open(GateHold::Confirming);
        gate.close(GateHold::Paused);
        assert_eq!(gate.generation(), 2);
        gate.open(GateHold::Paused);
        assert_eq!(gate.forward(|| ()).map(|(g, _)| g), Some(2));
    }
}
