//! One-shot delayed callbacks on the reactor's timer wheel.

use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::metrics;
use crate::reactor::{Core, Reactor};
use crate::wheel::TimerCore;

/// A one-shot timer armed on a reactor's wheel.
///
/// Created armed; fires once unless cancelled. The handler receives the
/// timer itself, so it can [`reset`](Timer::reset) to fire again or arm
/// follow-up work. `Clone` retains the same underlying timer.
///
/// Accuracy is one wheel tick
/// ([`tick_resolution_ms`](crate::Config::tick_resolution_ms)): a timer
/// armed with delay `d` fires no earlier than `d` rounded down to the
/// resolution and no later than `d` rounded up, including delays longer
/// than a full wheel revolution.
#[derive(Clone)]
pub struct Timer {
    core: Rc<TimerCore>,
    reactor: Weak<Core>,
}

impl Timer {
    /// Arm a new timer `delay` from now.
    pub fn new(reactor: &Reactor, delay: Duration, handler: impl FnMut(&Timer) + 'static) -> Timer {
        let core = TimerCore::new(Box::new(handler));
        reactor.core().wheel.borrow_mut().arm(&core, delay);
        metrics::TIMERS_ARMED.increment();
        Timer {
            core,
            reactor: Rc::downgrade(reactor.core()),
        }
    }

    pub(crate) fn from_parts(reactor: &Rc<Core>, core: Rc<TimerCore>) -> Timer {
        Timer {
            core,
            reactor: Rc::downgrade(reactor),
        }
    }

    /// Re-arm to fire `delay` from now, whether or not the timer is
    /// currently armed. Legal from inside the timer's own handler.
    pub fn reset(&self, delay: Duration) {
        let Some(reactor) = self.reactor.upgrade() else {
            return;
        };
        let mut wheel = reactor.wheel.borrow_mut();
        wheel.cancel(&self.core);
        wheel.arm(&self.core, delay);
        metrics::TIMERS_ARMED.increment();
    }

    /// Unlink a pending firing. The handler will not run. Cancelling a
    /// timer that already fired or was already cancelled is a no-op.
    pub fn cancel(&self) {
        let Some(reactor) = self.reactor.upgrade() else {
            return;
        };
        if reactor.wheel.borrow_mut().cancel(&self.core) {
            metrics::TIMERS_CANCELLED.increment();
        }
    }

    pub(crate) fn core(&self) -> &Rc<TimerCore> {
        &self.core
    }
}
