//! The timer wheel.
//!
//! A fixed ring of FIFO slot queues. Arming a timer appends it to the
//! slot `delay_slots` ahead of the current position; delays longer than
//! one revolution carry an absolute due tick and ride around until the
//! wheel reaches it. Arm and cancel are amortized O(1); a tick visits
//! only the slots the clock has passed.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::timer::Timer;

/// Arming state of a timer. `due_tick` is absolute: the wheel fires the
/// timer when its tick counter reaches it. The remaining whole
/// revolutions (`rounds`) fall out as `(due_tick - ticks) / slots`.
/// `Firing` covers the window between a tick collecting a due timer
/// and its handler running, so a cancel from earlier in the same batch
/// still suppresses the invocation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerState {
    Idle,
    Armed { slot: usize, due_tick: u64 },
    Firing,
}

/// Shared timer state: arming slot plus the user handler.
///
/// The handler stays in place across firings so a handler can re-arm its
/// own timer; it is taken out only for the duration of each invocation.
pub(crate) struct TimerCore {
    pub(crate) state: Cell<TimerState>,
    pub(crate) handler: RefCell<Option<Box<dyn FnMut(&Timer)>>>,
}

impl TimerCore {
    pub(crate) fn new(handler: Box<dyn FnMut(&Timer)>) -> Rc<TimerCore> {
        Rc::new(TimerCore {
            state: Cell::new(TimerState::Idle),
            handler: RefCell::new(Some(handler)),
        })
    }
}

pub(crate) struct Wheel {
    slots: Vec<VecDeque<Rc<TimerCore>>>,
    /// Current slot position.
    pos: usize,
    /// Total slots advanced since creation.
    ticks: u64,
    /// Number of armed timers.
    armed: usize,
    resolution: Duration,
    /// Time of the last slot boundary. Advanced in whole-resolution
    /// steps so slot edges do not drift.
    last_tick: Instant,
}

impl Wheel {
    pub(crate) fn new(slots: usize, resolution: Duration, now: Instant) -> Wheel {
        Wheel {
            slots: (0..slots).map(|_| VecDeque::new()).collect(),
            pos: 0,
            ticks: 0,
            armed: 0,
            resolution,
            last_tick: now,
        }
    }

    /// Number of armed timers.
    pub(crate) fn armed(&self) -> usize {
        self.armed
    }

    /// Link a timer `delay` ahead of the current position. The wheel
    /// holds its own reference until the timer fires or is cancelled.
    pub(crate) fn arm(&mut self, core: &Rc<TimerCore>, delay: Duration) {
        debug_assert!(matches!(core.state.get(), TimerState::Idle));
        let delay_slots = self.delay_slots(delay);
        let due_tick = self.ticks + delay_slots;
        let slot = ((self.pos as u64 + delay_slots) % self.slots.len() as u64) as usize;
        core.state.set(TimerState::Armed { slot, due_tick });
        self.slots[slot].push_back(Rc::clone(core));
        self.armed += 1;
    }

    /// Unlink a timer and drop the wheel's reference. Returns whether
    /// a pending firing was removed; cancelling an idle timer is a
    /// no-op.
    pub(crate) fn cancel(&mut self, core: &Rc<TimerCore>) -> bool {
        match core.state.get() {
            TimerState::Idle => false,
            // Collected by the current tick but not yet invoked:
            // marking it idle suppresses the invocation.
            TimerState::Firing => {
                core.state.set(TimerState::Idle);
                true
            }
            TimerState::Armed { slot, .. } => {
                let queue = &mut self.slots[slot];
                if let Some(i) = queue.iter().position(|t| Rc::ptr_eq(t, core)) {
                    queue.remove(i);
                    self.armed -= 1;
                }
                core.state.set(TimerState::Idle);
                true
            }
        }
    }

    /// Advance the wheel to `now` and collect due timers, unlinked and
    /// marked idle, in firing order: ascending slot order, FIFO within a
    /// slot. The caller invokes the handlers with no wheel borrow held.
    pub(crate) fn collect_due(&mut self, now: Instant) -> Vec<Rc<TimerCore>> {
        let mut due = Vec::new();
        let res_ms = self.resolution.as_millis() as u64;
        let elapsed =
            now.saturating_duration_since(self.last_tick).as_millis() as u64 / res_ms;

        // Delay-0 timers land in the current slot and fire on the very
        // next tick, whether or not a slot boundary has passed.
        self.armed -= drain_due(&mut self.slots[self.pos], self.ticks, &mut due);

        for _ in 0..elapsed {
            self.pos = (self.pos + 1) % self.slots.len();
            self.ticks += 1;
            self.armed -= drain_due(&mut self.slots[self.pos], self.ticks, &mut due);
        }
        self.last_tick += Duration::from_millis(elapsed * res_ms);
        due
    }

    /// Delay until the earliest armed timer is due. `None` when the
    /// wheel is empty.
    pub(crate) fn next_wake(&self, now: Instant) -> Option<Duration> {
        if self.armed == 0 {
            return None;
        }
        let mut min_due: Option<u64> = None;
        for queue in &self.slots {
            for timer in queue {
                if let TimerState::Armed { due_tick, .. } = timer.state.get() {
                    min_due = Some(min_due.map_or(due_tick, |m| m.min(due_tick)));
                }
            }
        }
        let due_tick = min_due?;
        let delta = due_tick.saturating_sub(self.ticks);
        let deadline =
            self.last_tick + Duration::from_millis(delta * self.resolution.as_millis() as u64);
        Some(deadline.saturating_duration_since(now))
    }

    /// Delay rounded to the nearest whole slot.
    fn delay_slots(&self, delay: Duration) -> u64 {
        let res_ms = self.resolution.as_millis() as u64;
        (delay.as_millis() as u64 + res_ms / 2) / res_ms
    }
}

impl Drop for Wheel {
    fn drop(&mut self) {
        // Handlers may have captured timer handles; drop them so the
        // Rc cycles break when the reactor goes away.
        for queue in &self.slots {
            for timer in queue {
                timer.handler.borrow_mut().take();
            }
        }
    }
}

/// Remove due timers (in FIFO order) from one slot queue, marking them
/// firing. Returns how many were removed.
fn drain_due(
    queue: &mut VecDeque<Rc<TimerCore>>,
    ticks: u64,
    due: &mut Vec<Rc<TimerCore>>,
) -> usize {
    let mut removed = 0;
    let mut i = 0;
    while i < queue.len() {
        let fire = match queue[i].state.get() {
            TimerState::Armed { due_tick, .. } => due_tick <= ticks,
            TimerState::Idle | TimerState::Firing => false,
        };
        if fire {
            if let Some(core) = queue.remove(i) {
                core.state.set(TimerState::Firing);
                due.push(core);
                removed += 1;
            }
        } else {
            i += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    const RES: Duration = Duration::from_millis(10);

    fn noop() -> Rc<TimerCore> {
        TimerCore::new(Box::new(|_| {}))
    }

    fn at(start: Instant, ms: u64) -> Instant {
        start + Duration::from_millis(ms)
    }

    #[test]
    fn fires_in_due_slot() {
        let start = Instant::now();
        let mut wheel = Wheel::new(8, RES, start);
        let timer = noop();
        wheel.arm(&timer, Duration::from_millis(30));

        assert!(wheel.collect_due(at(start, 20)).is_empty());
        let due = wheel.collect_due(at(start, 30));
        assert_eq!(due.len(), 1);
        assert!(Rc::ptr_eq(&due[0], &timer));
        assert_eq!(wheel.armed(), 0);
    }

    #[test]
    fn zero_delay_fires_on_next_tick() {
        let start = Instant::now();
        let mut wheel = Wheel::new(8, RES, start);
        let timer = noop();
        wheel.arm(&timer, Duration::ZERO);
        assert_eq!(wheel.next_wake(start), Some(Duration::ZERO));
        let due = wheel.collect_due(start);
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn multi_round_delay_survives_wraparound() {
        let start = Instant::now();
        let mut wheel = Wheel::new(4, RES, start);
        let timer = noop();
        // 100ms = 10 slots = 2.5 revolutions of a 4-slot wheel.
        wheel.arm(&timer, Duration::from_millis(100));

        // A full revolution later it must not fire.
        assert!(wheel.collect_due(at(start, 40)).is_empty());
        assert!(wheel.collect_due(at(start, 80)).is_empty());
        assert!(wheel.collect_due(at(start, 90)).is_empty());
        assert_eq!(wheel.collect_due(at(start, 100)).len(), 1);
    }

    #[test]
    fn exact_revolution_fires_after_one_revolution() {
        let start = Instant::now();
        let mut wheel = Wheel::new(4, RES, start);
        let timer = noop();
        // Exactly one revolution: 4 slots.
        wheel.arm(&timer, Duration::from_millis(40));
        assert!(wheel.collect_due(at(start, 30)).is_empty());
        assert_eq!(wheel.collect_due(at(start, 40)).len(), 1);
    }

    #[test]
    fn cancel_prevents_firing_and_is_idempotent() {
        let start = Instant::now();
        let mut wheel = Wheel::new(8, RES, start);
        let timer = noop();
        wheel.arm(&timer, Duration::from_millis(20));

        assert!(wheel.cancel(&timer));
        assert!(!wheel.cancel(&timer));
        assert_eq!(wheel.armed(), 0);
        assert!(wheel.collect_due(at(start, 100)).is_empty());
    }

    #[test]
    fn same_slot_fires_in_insertion_order() {
        let start = Instant::now();
        let mut wheel = Wheel::new(8, RES, start);
        let first = noop();
        let second = noop();
        wheel.arm(&first, Duration::from_millis(20));
        wheel.arm(&second, Duration::from_millis(20));

        let due = wheel.collect_due(at(start, 20));
        assert_eq!(due.len(), 2);
        assert!(Rc::ptr_eq(&due[0], &first));
        assert!(Rc::ptr_eq(&due[1], &second));
    }

    #[test]
    fn slots_fire_in_time_order() {
        let start = Instant::now();
        let mut wheel = Wheel::new(8, RES, start);
        let late = noop();
        let early = noop();
        wheel.arm(&late, Duration::from_millis(30));
        wheel.arm(&early, Duration::from_millis(10));

        let due = wheel.collect_due(at(start, 40));
        assert_eq!(due.len(), 2);
        assert!(Rc::ptr_eq(&due[0], &early));
        assert!(Rc::ptr_eq(&due[1], &late));
    }

    #[test]
    fn next_wake_covers_multi_round_timers() {
        let start = Instant::now();
        let mut wheel = Wheel::new(4, RES, start);
        let timer = noop();
        wheel.arm(&timer, Duration::from_millis(100));
        // The only timer is 10 slots out; the hint must reflect it
        // rather than reporting idle-forever.
        assert_eq!(wheel.next_wake(start), Some(Duration::from_millis(100)));
    }

    #[test]
    fn delay_rounds_to_nearest_slot() {
        let start = Instant::now();
        let mut wheel = Wheel::new(8, RES, start);
        let timer = noop();
        // 14ms rounds down to 1 slot.
        wheel.arm(&timer, Duration::from_millis(14));
        assert_eq!(wheel.collect_due(at(start, 10)).len(), 1);

        let timer = noop();
        // 16ms rounds up to 2 slots (armed at the 10ms boundary).
        wheel.arm(&timer, Duration::from_millis(16));
        assert!(wheel.collect_due(at(start, 20)).is_empty());
        assert_eq!(wheel.collect_due(at(start, 30)).len(), 1);
    }
}
