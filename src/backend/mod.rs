//! Pluggable OS polling backends.
//!
//! A [`Backend`] turns the reactor's registered descriptors into one
//! blocking OS wait and reports which descriptors came back ready. The
//! reactor picks one at construction — automatically (epoll on Linux,
//! then poll) or explicitly — and never changes it afterwards. Custom
//! implementations can be injected with
//! [`Reactor::with_backend`](crate::Reactor::with_backend), which is
//! also how the fault-injection tests drive the error path.

#[cfg(target_os = "linux")]
pub(crate) mod epoll;
pub(crate) mod poll;
pub(crate) mod select;

use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::config::{BackendKind, Config};
use crate::error::Error;
use crate::io::Registration;

/// Readiness reported for one descriptor by [`Backend::wait`].
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// An OS polling facility adapter.
///
/// `wait` must build its watch set from the *current* want flags of the
/// registrations it is given, block until readiness or the timeout,
/// retry `EINTR` internally, and propagate any genuine OS failure —
/// the reactor treats such an error as fatal and returns it from
/// [`run`](crate::Reactor::run).
pub trait Backend {
    /// Backend name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Start watching a descriptor. A failure here leaves the
    /// descriptor unregistered.
    fn add(&mut self, reg: &Registration) -> Result<(), Error>;

    /// Stop watching a descriptor. Best-effort; called with the fd
    /// still open.
    fn del(&mut self, reg: &Registration) -> Result<(), Error>;

    /// Re-synchronize a registration with its current want flags.
    /// Backends that rebuild their watch set every call need nothing
    /// here.
    fn reset(&mut self, _reg: &Registration) -> Result<(), Error> {
        Ok(())
    }

    /// Block until readiness or `timeout` (`None` = no timeout) and
    /// report ready descriptors.
    fn wait(
        &mut self,
        entries: &[Rc<Registration>],
        timeout: Option<Duration>,
    ) -> Result<Vec<Ready>, Error>;
}

/// Build the backend for a config: explicit kind, `EDDYLINE_BACKEND`
/// override, or automatic preference order.
pub(crate) fn create(config: &Config) -> Result<Box<dyn Backend>, Error> {
    match config.backend.or_else(env_override) {
        #[cfg(target_os = "linux")]
        Some(BackendKind::Epoll) => Ok(Box::new(epoll::Epoll::new(config)?)),
        #[cfg(not(target_os = "linux"))]
        Some(BackendKind::Epoll) => Err(Error::Unsupported("epoll requires Linux")),
        Some(BackendKind::Poll) => Ok(Box::new(poll::Poll::new())),
        Some(BackendKind::Select) => Ok(Box::new(select::Select::new())),
        None => {
            #[cfg(target_os = "linux")]
            if let Ok(backend) = epoll::Epoll::new(config) {
                return Ok(Box::new(backend));
            }
            Ok(Box::new(poll::Poll::new()))
        }
    }
}

fn env_override() -> Option<BackendKind> {
    match std::env::var("EDDYLINE_BACKEND").ok()?.as_str() {
        "epoll" => Some(BackendKind::Epoll),
        "poll" => Some(BackendKind::Poll),
        "select" => Some(BackendKind::Select),
        _ => None,
    }
}

/// Timeout as whole milliseconds for epoll/poll, rounded up so a timer
/// never wakes a tick early. `-1` blocks indefinitely.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(duration) => {
            let ms = duration.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}
