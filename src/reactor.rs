//! The reactor: descriptor table, timer wheel, and the run loop.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

use crate::backend::{self, Backend};
use crate::config::{self, Config};
use crate::error::Error;
use crate::io::{self, Registration};
use crate::metrics;
use crate::timer::Timer;
use crate::wheel::{TimerState, Wheel};

/// Shared reactor state. Handles (streams, timers, servers) keep weak
/// references to it; the registered-descriptor table keeps the strong
/// references that pin live descriptors.
pub(crate) struct Core {
    pub(crate) config: Config,
    pub(crate) table: RefCell<HashMap<RawFd, Rc<Registration>>>,
    pub(crate) wheel: RefCell<Wheel>,
    pub(crate) backend: RefCell<Box<dyn Backend>>,
}

impl Core {
    /// Register a descriptor: backend first, then the table's retained
    /// reference. A backend failure leaves the descriptor unregistered
    /// (and the caller's `OwnedFd` unwinds it).
    pub(crate) fn add(self: &Rc<Self>, reg: &Rc<Registration>) -> Result<(), Error> {
        self.backend.borrow_mut().add(reg)?;
        self.table.borrow_mut().insert(reg.fd(), Rc::clone(reg));
        metrics::DESCRIPTORS_REGISTERED.increment();
        metrics::DESCRIPTORS_ACTIVE.increment();
        Ok(())
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        // Registrations may hold closures that captured handles back to
        // themselves; drop the closures so the Rc cycles break and fds
        // close.
        for reg in self.table.borrow().values() {
            reg.driver.borrow_mut().clear_handlers();
        }
    }
}

/// A single-threaded event reactor.
///
/// Owns the registered descriptors and the timer wheel, and delegates
/// blocking to a polling [`Backend`] chosen at construction. `Clone`
/// retains the same reactor. A reactor and everything registered on it
/// must stay on one thread; the sanctioned cross-thread boundary is
/// [`wake_channel`](crate::wake_channel).
#[derive(Clone)]
pub struct Reactor {
    core: Rc<Core>,
}

impl Reactor {
    /// Build a reactor with the process-wide default configuration and
    /// automatic backend selection.
    pub fn new() -> Result<Reactor, Error> {
        Self::with_config(config::default_config())
    }

    /// Build a reactor with an explicit configuration.
    pub fn with_config(config: Config) -> Result<Reactor, Error> {
        config.validate()?;
        let backend = backend::create(&config)?;
        Ok(Self::assemble(config, backend))
    }

    /// Build a reactor around an injected backend. This is the
    /// instrumentation seam: tests substitute a backend to drive
    /// readiness or fail the wait on demand.
    pub fn with_backend(config: Config, backend: Box<dyn Backend>) -> Result<Reactor, Error> {
        config.validate()?;
        Ok(Self::assemble(config, backend))
    }

    fn assemble(config: Config, backend: Box<dyn Backend>) -> Reactor {
        let wheel = Wheel::new(
            config.wheel_slots,
            config.tick_resolution(),
            Instant::now(),
        );
        Reactor {
            core: Rc::new(Core {
                config,
                table: RefCell::new(HashMap::new()),
                wheel: RefCell::new(wheel),
                backend: RefCell::new(backend),
            }),
        }
    }

    pub(crate) fn from_core(core: Rc<Core>) -> Reactor {
        Reactor { core }
    }

    /// The active backend's name (`"epoll"`, `"poll"`, `"select"`, or
    /// whatever an injected backend reports).
    pub fn backend_name(&self) -> &'static str {
        self.core.backend.borrow().name()
    }

    /// Number of descriptors currently registered.
    pub fn descriptor_count(&self) -> usize {
        self.core.table.borrow().len()
    }

    /// Number of armed timers.
    pub fn timer_count(&self) -> usize {
        self.core.wheel.borrow().armed()
    }

    /// Run until idle: block in the backend, pump ready descriptors,
    /// fire due timers; repeat while any descriptor or timer remains.
    ///
    /// Returns `Ok(())` once both the descriptor table and the timer
    /// wheel are empty. Per-descriptor errors are contained — they
    /// reach that descriptor's error and close handlers — and only a
    /// failure of the backend's own wait call makes `run` return an
    /// error.
    pub fn run(&self) -> Result<(), Error> {
        loop {
            io::sweep_closing(&self.core);

            let descriptors = self.core.table.borrow().len();
            let timers = self.core.wheel.borrow().armed();
            if descriptors == 0 && timers == 0 {
                return Ok(());
            }

            let timeout = self.core.wheel.borrow().next_wake(Instant::now());
            let entries: Vec<Rc<Registration>> =
                self.core.table.borrow().values().cloned().collect();
            let ready = self.core.backend.borrow_mut().wait(&entries, timeout)?;
            metrics::BACKEND_WAITS.increment();

            io::dispatch(&self.core, ready);
            self.tick_timers();
        }
    }

    fn tick_timers(&self) {
        let due = self.core.wheel.borrow_mut().collect_due(Instant::now());
        for timer_core in due {
            // A handler earlier in this batch may have cancelled it.
            if timer_core.state.get() != TimerState::Firing {
                continue;
            }
            timer_core.state.set(TimerState::Idle);
            metrics::TIMERS_FIRED.increment();
            let timer = Timer::from_parts(&self.core, Rc::clone(&timer_core));
            let handler = timer_core.handler.borrow_mut().take();
            if let Some(mut handler) = handler {
                handler(&timer);
                let mut slot = timer_core.handler.borrow_mut();
                if slot.is_none() {
                    *slot = Some(handler);
                }
            }
        }
    }

    pub(crate) fn core(&self) -> &Rc<Core> {
        &self.core
    }
}
