//! Per-component scheduled-state machine
//!
//! States: Disabled, Stopped, Running. Enabling moves Disabled to Stopped;
//! starting moves Stopped to Running and is rejected while invalid;
//! disabling is rejected while Running. The cell also carries the atomic
//! active-task counter consulted on every dispatch and the yield/penalty
//! suppression windows.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

/// Lifecycle state of a schedulable component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduledState {
    /// Excluded from scheduling until enabled
    Disabled,
    /// Enabled but not scheduled
    Stopped,
    /// Scheduled for execution
    Running,
}

const STATE_DISABLED: u8 = 0;
const STATE_STOPPED: u8 = 1;
const STATE_RUNNING: u8 = 2;

fn encode(state: ScheduledState) -> u8 {
    match state {
        ScheduledState::Disabled => STATE_DISABLED,
        ScheduledState::Stopped => STATE_STOPPED,
        ScheduledState::Running => STATE_RUNNING,
    }
}

fn decode(raw: u8) -> ScheduledState {
    match raw {
        STATE_DISABLED => ScheduledState::Disabled,
        STATE_RUNNING => ScheduledState::Running,
        _ => ScheduledState::Stopped,
    }
}

/// Scheduled state plus the per-component dispatch accounting.
#[derive(Debug)]
pub struct ScheduleCell {
    state: AtomicU8,
    active_tasks: AtomicUsize,
    yielded_until_ms: AtomicU64,
    penalized_until_ms: AtomicU64,
}

impl Default for ScheduleCell {
    fn default() -> Self {
        Self::new(ScheduledState::Stopped)
    }
}

impl ScheduleCell {
    /// Create a cell in the given initial state.
    pub fn new(initial: ScheduledState) -> Self {
        Self {
            state: AtomicU8::new(encode(initial)),
            active_tasks: AtomicUsize::new(0),
            yielded_until_ms: AtomicU64::new(0),
            penalized_until_ms: AtomicU64::new(0),
        }
    }

    /// Current state.
    pub fn state(&self) -> ScheduledState {
        decode(self.state.load(Ordering::SeqCst))
    }

    /// Disabled → Stopped.
    pub fn enable(&self) -> EngineResult<()> {
        self.transition(ScheduledState::Disabled, ScheduledState::Stopped)
            .map_err(|actual| {
                EngineError::IllegalState(format!("Cannot enable component while {:?}", actual))
            })
    }

    /// Stopped → Disabled. Rejected while Running.
    pub fn disable(&self) -> EngineResult<()> {
        self.transition(ScheduledState::Stopped, ScheduledState::Disabled)
            .map_err(|actual| {
                EngineError::IllegalState(format!("Cannot disable component while {:?}", actual))
            })
    }

    /// Stopped → Running. The caller checks validity first.
    pub fn start(&self) -> EngineResult<()> {
        self.transition(ScheduledState::Stopped, ScheduledState::Running)
            .map_err(|actual| {
                EngineError::IllegalState(format!("Cannot start component while {:?}", actual))
            })
    }

    /// Running → Stopped.
    pub fn stop(&self) -> EngineResult<()> {
        self.transition(ScheduledState::Running, ScheduledState::Stopped)
            .map_err(|actual| {
                EngineError::IllegalState(format!("Cannot stop component while {:?}", actual))
            })
    }

    fn transition(
        &self,
        from: ScheduledState,
        to: ScheduledState,
    ) -> Result<(), ScheduledState> {
        self.state
            .compare_exchange(encode(from), encode(to), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(decode)
    }

    /// Whether a start transition is currently legal.
    pub fn verify_can_start(&self) -> EngineResult<()> {
        match self.state() {
            ScheduledState::Stopped => Ok(()),
            actual => Err(EngineError::IllegalState(format!(
                "Cannot start component while {:?}",
                actual
            ))),
        }
    }

    /// Whether a stop transition is currently legal.
    pub fn verify_can_stop(&self) -> EngineResult<()> {
        match self.state() {
            ScheduledState::Running => Ok(()),
            actual => Err(EngineError::IllegalState(format!(
                "Cannot stop component while {:?}",
                actual
            ))),
        }
    }

    /// Whether the component may be deleted: not running and idle.
    pub fn verify_can_delete(&self) -> EngineResult<()> {
        if self.state() == ScheduledState::Running {
            return Err(EngineError::IllegalState(
                "Cannot delete component while Running".to_string(),
            ));
        }
        if self.active_tasks() > 0 {
            return Err(EngineError::IllegalState(
                "Cannot delete component with active tasks".to_string(),
            ));
        }
        Ok(())
    }

    /// Attempt to take a trigger slot; fails when `max_concurrent` slots are
    /// already in use.
    pub fn try_acquire_trigger(&self, max_concurrent: usize) -> bool {
        let mut current = self.active_tasks.load(Ordering::SeqCst);
        loop {
            if current >= max_concurrent {
                return false;
            }
            match self.active_tasks.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Release a trigger slot.
    pub fn release_trigger(&self) {
        let previous = self.active_tasks.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "trigger release without acquire");
    }

    /// Number of workers currently inside the component.
    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Exclude the component from scheduling for the given period.
    pub fn yield_for(&self, period: Duration) {
        let until = now_millis() + period.as_millis() as u64;
        self.yielded_until_ms.fetch_max(until, Ordering::SeqCst);
    }

    /// Apply the post-failure cooldown.
    pub fn penalize_for(&self, period: Duration) {
        let until = now_millis() + period.as_millis() as u64;
        self.penalized_until_ms.fetch_max(until, Ordering::SeqCst);
    }

    /// Whether a yield or penalty window is currently in force.
    pub fn is_suppressed(&self) -> bool {
        let now = now_millis();
        now < self.yielded_until_ms.load(Ordering::SeqCst)
            || now < self.penalized_until_ms.load(Ordering::SeqCst)
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ScheduledState::Disabled, ScheduleCell::enable, ScheduledState::Stopped; "enable from disabled")]
    #[test_case(ScheduledState::Stopped, ScheduleCell::disable, ScheduledState::Disabled; "disable from stopped")]
    #[test_case(ScheduledState::Stopped, ScheduleCell::start, ScheduledState::Running; "start from stopped")]
    #[test_case(ScheduledState::Running, ScheduleCell::stop, ScheduledState::Stopped; "stop from running")]
    fn test_legal_transitions(
        initial: ScheduledState,
        op: fn(&ScheduleCell) -> EngineResult<()>,
        expected: ScheduledState,
    ) {
        let cell = ScheduleCell::new(initial);
        op(&cell).expect("transition should succeed");
        assert_eq!(cell.state(), expected);
    }

    #[test_case(ScheduledState::Running, ScheduleCell::enable; "enable while running")]
    #[test_case(ScheduledState::Running, ScheduleCell::disable; "disable while running")]
    #[test_case(ScheduledState::Disabled, ScheduleCell::start; "start while disabled")]
    #[test_case(ScheduledState::Stopped, ScheduleCell::stop; "stop while stopped")]
    fn test_illegal_transitions(initial: ScheduledState, op: fn(&ScheduleCell) -> EngineResult<()>) {
        let cell = ScheduleCell::new(initial);
        assert!(op(&cell).is_err());
        assert_eq!(cell.state(), initial);
    }

    #[test]
    fn test_trigger_slots_respect_cap() {
        let cell = ScheduleCell::new(ScheduledState::Running);
        assert!(cell.try_acquire_trigger(2));
        assert!(cell.try_acquire_trigger(2));
        assert!(!cell.try_acquire_trigger(2));
        cell.release_trigger();
        assert!(cell.try_acquire_trigger(2));
    }

    #[test]
    fn test_delete_requires_idle() {
        let cell = ScheduleCell::new(ScheduledState::Running);
        assert!(cell.verify_can_delete().is_err());
        cell.stop().expect("stop");
        cell.try_acquire_trigger(1);
        assert!(cell.verify_can_delete().is_err());
        cell.release_trigger();
        assert!(cell.verify_can_delete().is_ok());
    }

    #[test]
    fn test_suppression_windows() {
        let cell = ScheduleCell::default();
        assert!(!cell.is_suppressed());
        cell.yield_for(Duration::from_secs(60));
        assert!(cell.is_suppressed());

        let penalized = ScheduleCell::default();
        penalized.penalize_for(Duration::from_secs(60));
        assert!(penalized.is_suppressed());
    }
}
