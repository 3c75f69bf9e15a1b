//! Mutual exclusion between poll cycles and index-editing operations.
//!
//! The engine is in one of three states: idle, running a poll cycle, or
//! paused by one or more mutations. A cycle only starts from idle. A mutation
//! first blocks new cycles, then waits for a cycle that is already running to
//! finish, so a cycle never publishes a snapshot that races a mutation's edits.
//! Both guards release their state on drop, which covers every exit path.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// Observable engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Nothing running. The next tick may start a cycle.
    Idle,
    /// A poll cycle is running.
    CycleInFlight,
    /// At least one mutation holds a pause guard.
    Paused,
}

#[derive(Debug, Default)]
struct GateState {
    paused: usize,
    cycle_in_flight: bool,
}

/// Shared gate that poll cycles and mutations both go through.
#[derive(Debug, Default)]
pub struct EngineGate {
    state: Mutex<GateState>,
    cycle_done: Notify,
}

impl EngineGate {
    /// Create an idle gate.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the current state.
    pub fn state(&self) -> EngineState {
        let state = self.state.lock();
        if state.cycle_in_flight {
            EngineState::CycleInFlight
        } else if state.paused > 0 {
            EngineState::Paused
        } else {
            EngineState::Idle
        }
    }

    /// Enter the cycle state if the engine is idle.
    pub fn try_begin_cycle(self: &Arc<Self>) -> Option<CycleGuard> {
        let mut state = self.state.lock();
        if state.paused > 0 || state.cycle_in_flight {
            return None;
        }
        state.cycle_in_flight = true;
        Some(CycleGuard {
            gate: Arc::clone(self),
        })
    }

    /// Pause the watcher and wait until no cycle is running.
    pub async fn pause(self: &Arc<Self>) -> PauseGuard {
        self.state.lock().paused += 1;
        let guard = PauseGuard {
            gate: Arc::clone(self),
        };

        loop {
            let done = self.cycle_done.notified();
            if !self.state.lock().cycle_in_flight {
                break;
            }
            tracing::trace!("Mutation waiting for in-flight poll cycle");
            done.await;
        }
        guard
    }
}

/// Held for the duration of one poll cycle.
#[derive(Debug)]
pub struct CycleGuard {
    gate: Arc<EngineGate>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.gate.state.lock().cycle_in_flight = false;
        self.gate.cycle_done.notify_waiters();
    }
}

/// Held for the duration of one mutation.
#[derive(Debug)]
pub struct PauseGuard {
    gate: Arc<EngineGate>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.paused = state.paused.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_at_most_one_cycle() {
        let gate = EngineGate::new();
        let first = gate.try_begin_cycle();
        assert!(first.is_some());
        assert_eq!(gate.state(), EngineState::CycleInFlight);
        assert!(gate.try_begin_cycle().is_none());

        drop(first);
        assert_eq!(gate.state(), EngineState::Idle);
        assert!(gate.try_begin_cycle().is_some());
    }

    #[tokio::test]
    async fn test_pause_blocks_cycles_until_released() {
        let gate = EngineGate::new();
        let pause = gate.pause().await;
        assert_eq!(gate.state(), EngineState::Paused);
        assert!(gate.try_begin_cycle().is_none());

        let second = gate.pause().await;
        drop(pause);
        assert!(gate.try_begin_cycle().is_none());

        drop(second);
        assert!(gate.try_begin_cycle().is_some());
    }

    #[tokio::test]
    async fn test_pause_waits_for_in_flight_cycle() {
        let gate = EngineGate::new();
        let cycle = gate.try_begin_cycle().unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let _pause = gate.pause().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(cycle);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gate.state(), EngineState::Idle);
    }
}
