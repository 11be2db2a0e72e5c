//! Registered descriptors and the fairness-bounded read/write pumps.
//!
//! Every descriptor the reactor watches is a [`Registration`]: the raw
//! fd, want/can flag pairs with a per-notification pump budget, and
//! close state, plus a [`Driver`] variant holding the type-specific
//! behavior (buffered stream or accept loop) and its user handlers.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use crate::backend::Ready;
use crate::config::Config;
use crate::metrics;
use crate::reactor::Core;
use crate::stream::{self, Stream, StreamCore};
use crate::tcp::{self, ListenerCore, TcpServer};

/// Want/can state for one direction, with the fairness budget.
pub(crate) struct IoFlags {
    /// Whether the descriptor wants this operation at all.
    pub(crate) want: Cell<bool>,
    /// Whether the OS reported the operation currently possible.
    pub(crate) can: Cell<bool>,
    /// Max pump iterations per readiness notification.
    pub(crate) limit: u8,
}

impl IoFlags {
    fn new(want: bool, limit: u8) -> IoFlags {
        IoFlags {
            want: Cell::new(want),
            can: Cell::new(false),
            limit,
        }
    }
}

/// Type-specific behavior of a registered descriptor.
pub(crate) enum Driver {
    Stream(StreamCore),
    Listener(ListenerCore),
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriverKind {
    Stream,
    Listener,
}

/// A close handler taken out of a driver for firing.
pub(crate) enum CloseHandler {
    Stream(Box<dyn FnMut(&Stream)>),
    Listener(Box<dyn FnMut(&TcpServer)>),
}

impl Driver {
    pub(crate) fn stream_mut(&mut self) -> Option<&mut StreamCore> {
        match self {
            Driver::Stream(core) => Some(core),
            _ => None,
        }
    }

    pub(crate) fn listener_mut(&mut self) -> Option<&mut ListenerCore> {
        match self {
            Driver::Listener(core) => Some(core),
            _ => None,
        }
    }

    fn kind(&self) -> DriverKind {
        match self {
            Driver::Stream(_) => DriverKind::Stream,
            Driver::Listener(_) => DriverKind::Listener,
        }
    }

    fn take_close_handler(&mut self) -> Option<CloseHandler> {
        match self {
            Driver::Stream(core) => core.on_close.take().map(CloseHandler::Stream),
            Driver::Listener(core) => core.on_close.take().map(CloseHandler::Listener),
        }
    }

    /// Drop every stored handler. Breaks reference cycles between a
    /// registration and handles captured by its own callbacks.
    pub(crate) fn clear_handlers(&mut self) {
        match self {
            Driver::Stream(core) => core.clear_handlers(),
            Driver::Listener(core) => core.clear_handlers(),
        }
    }
}

/// One registered non-blocking descriptor.
///
/// Public so custom [`Backend`](crate::Backend) implementations can
/// inspect the fd and want flags when building their watch sets.
pub struct Registration {
    fd: RawFd,
    handle: RefCell<Option<OwnedFd>>,
    pub(crate) read: IoFlags,
    pub(crate) write: IoFlags,
    /// Stop wanting reads, finish pending writes, then close.
    shutdown: Cell<bool>,
    closed: Cell<bool>,
    close_fired: Cell<bool>,
    pub(crate) driver: RefCell<Driver>,
}

impl Registration {
    pub(crate) fn new(fd: OwnedFd, driver: Driver, config: &Config) -> Rc<Registration> {
        Rc::new(Registration {
            fd: fd.as_raw_fd(),
            handle: RefCell::new(Some(fd)),
            read: IoFlags::new(true, config.read_limit),
            write: IoFlags::new(false, config.write_limit),
            shutdown: Cell::new(false),
            closed: Cell::new(false),
            close_fired: Cell::new(false),
            driver: RefCell::new(driver),
        })
    }

    /// The raw descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Whether the descriptor currently wants read readiness.
    pub fn wants_read(&self) -> bool {
        self.read.want.get() && !self.closed.get()
    }

    /// Whether the descriptor currently wants write readiness.
    pub fn wants_write(&self) -> bool {
        self.write.want.get() && !self.closed.get()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.get()
    }

    pub(crate) fn driver_kind(&self) -> DriverKind {
        self.driver.borrow().kind()
    }

    /// Graceful: stop reading, drain pending writes, then close.
    pub(crate) fn request_shutdown(&self) {
        self.read.want.set(false);
        self.shutdown.set(true);
    }

    /// Immediate: discard pending data and close at the next pass.
    pub(crate) fn hard_close(&self) {
        self.read.want.set(false);
        self.read.can.set(false);
        self.write.want.set(false);
        self.write.can.set(false);
        self.shutdown.set(true);
    }

    fn take_handle(&self) -> Option<OwnedFd> {
        self.handle.borrow_mut().take()
    }
}

/// Run the read pump: up to `read.limit` iterations of the driver's
/// raw-read, stopping when the descriptor no longer wants or no longer
/// can read. The iteration ordinal is forwarded to the raw-read.
/// Returns the number of iterations performed.
pub(crate) fn read_pump(core: &Rc<Core>, reg: &Rc<Registration>) -> u8 {
    let limit = reg.read.limit;
    let mut count: u8 = 0;
    while count < limit {
        if !reg.read.want.get() || reg.is_closed() {
            break;
        }
        match reg.driver_kind() {
            DriverKind::Stream => stream::perf_read(core, reg, count + 1),
            DriverKind::Listener => tcp::perf_accept(core, reg),
        }
        count += 1;
        if !reg.read.can.get() {
            break;
        }
    }
    count
}

/// Run the write pump, symmetric to [`read_pump`] over the write flags.
pub(crate) fn write_pump(core: &Rc<Core>, reg: &Rc<Registration>) -> u8 {
    let limit = reg.write.limit;
    let mut count: u8 = 0;
    while count < limit {
        if !reg.write.want.get() || reg.is_closed() {
            break;
        }
        match reg.driver_kind() {
            DriverKind::Stream => stream::perf_write(core, reg),
            DriverKind::Listener => {}
        }
        count += 1;
        if !reg.write.can.get() {
            break;
        }
    }
    count
}

/// Dispatch one batch of readiness events: pump ready descriptors,
/// re-arm the edge-triggered backend when a pump exhausts its budget
/// with capacity left, and finalize drained shutdowns.
pub(crate) fn dispatch(core: &Rc<Core>, ready: Vec<Ready>) {
    for event in ready {
        let reg = {
            let table = core.table.borrow();
            match table.get(&event.fd) {
                Some(reg) => Rc::clone(reg),
                None => continue,
            }
        };
        if reg.is_closed() {
            continue;
        }
        if event.readable {
            let count = read_pump(core, &reg);
            if count == reg.read.limit && reg.read.can.get() && !reg.is_closed() {
                let _ = core.backend.borrow_mut().reset(&reg);
            }
        }
        if event.writable && !reg.is_closed() {
            let count = write_pump(core, &reg);
            if count == reg.write.limit && reg.write.can.get() && !reg.is_closed() {
                let _ = core.backend.borrow_mut().reset(&reg);
            }
        }
        if reg.shutdown_requested() && !reg.write.want.get() {
            finalize_close(core, &reg);
        }
    }
}

/// Finalize descriptors whose shutdown completed outside a readiness
/// pass (hard close, or shutdown with nothing left to drain).
pub(crate) fn sweep_closing(core: &Rc<Core>) {
    let pending: Vec<Rc<Registration>> = core
        .table
        .borrow()
        .values()
        .filter(|reg| reg.shutdown_requested() && !reg.write.want.get())
        .cloned()
        .collect();
    for reg in pending {
        finalize_close(core, &reg);
    }
}

/// Tear a descriptor down: deregister, close the fd, deliver the close
/// handler exactly once, and drop all handlers so handle cycles break.
pub(crate) fn finalize_close(core: &Rc<Core>, reg: &Rc<Registration>) {
    if reg.close_fired.replace(true) {
        return;
    }
    reg.closed.set(true);
    reg.read.want.set(false);
    reg.read.can.set(false);
    reg.write.want.set(false);
    reg.write.can.set(false);

    // An idle timeout on the wheel would otherwise keep the reactor
    // alive after the stream is gone.
    let idle = reg
        .driver
        .borrow_mut()
        .stream_mut()
        .and_then(|s| s.take_idle_timer());
    if let Some(timer) = idle {
        core.wheel.borrow_mut().cancel(&timer);
    }

    let _ = core.backend.borrow_mut().del(reg);
    core.table.borrow_mut().remove(&reg.fd());
    drop(reg.take_handle());
    metrics::DESCRIPTORS_CLOSED.increment();
    metrics::DESCRIPTORS_ACTIVE.decrement();

    let taken = reg.driver.borrow_mut().take_close_handler();
    match taken {
        Some(CloseHandler::Stream(mut handler)) => handler(&Stream::from_parts(core, reg)),
        Some(CloseHandler::Listener(mut handler)) => handler(&TcpServer::from_parts(core, reg)),
        None => {}
    }
    reg.driver.borrow_mut().clear_handlers();
}

/// Put `fd` into non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), io::Error> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Mark `fd` close-on-exec.
pub(crate) fn set_cloexec(fd: RawFd) -> Result<(), io::Error> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
