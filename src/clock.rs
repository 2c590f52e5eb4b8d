//! Clocks
//!
//! Two notions of time live here:
//! - the wall clock source driving the realtime poll loop (injectable, so
//!   tests hand-advance a mock instead of sleeping), and
//! - the logical clock: the single mutable "current logical time" slot that
//!   is save/restored around every action invocation.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// Injectable wall-clock source. Returns monotonic elapsed seconds from an
/// arbitrary origin; the scheduler only ever looks at differences.
pub type ClockFn = Rc<dyn Fn() -> f64>;

/// Default wall clock: seconds elapsed since the source was created.
pub fn wall_clock() -> ClockFn {
    let anchor = Instant::now();
    Rc::new(move || anchor.elapsed().as_secs_f64())
}

/// The current logical time slot.
///
/// The slot is only meaningful while a triggered action's callback is on the
/// stack: dispatch saves the previous value, substitutes the action's target
/// time, and restores on exit. Nested dispatches therefore each see their
/// own event-local "now", dynamic-scope style. Outside any action the slot
/// holds the last base value it was reset to (0.0 initially) - a known sharp
/// edge callers should not lean on.
#[derive(Clone)]
pub struct LogicalClock {
    slot: Rc<Cell<f64>>,
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicalClock {
    pub fn new() -> Self {
        Self {
            slot: Rc::new(Cell::new(0.0)),
        }
    }

    /// Read the slot.
    pub fn now(&self) -> f64 {
        self.slot.get()
    }

    /// Reset the resting value of the slot (start position, sync bounds).
    pub(crate) fn set_base(&self, t: f64) {
        self.slot.set(t);
    }

    /// Substitute `t` for the duration of the returned guard. The previous
    /// value comes back when the guard drops, on unwind included.
    pub(crate) fn enter(&self, t: f64) -> NowGuard {
        let prev = self.slot.replace(t);
        NowGuard {
            slot: self.slot.clone(),
            prev,
        }
    }
}

/// Scoped restore for [`LogicalClock::enter`].
pub(crate) struct NowGuard {
    slot: Rc<Cell<f64>>,
    prev: f64,
}

impl Drop for NowGuard {
    fn drop(&mut self) {
        self.slot.set(self.prev);
    }
}
