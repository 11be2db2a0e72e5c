//! Edge-triggered epoll backend (Linux).
//!
//! Descriptors register once with the full event mask; readiness
//! arrives as edges, so the reactor re-arms with `EPOLL_CTL_MOD`
//! whenever a pump leaves capacity on the table (budget exhausted with
//! `can` still set, or new data queued on an idle descriptor).

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use crate::backend::{Backend, Ready, timeout_millis};
use crate::config::Config;
use crate::error::Error;
use crate::io::Registration;

const READABLE: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
const WRITABLE: u32 = (libc::EPOLLOUT | libc::EPOLLERR) as u32;

pub(crate) struct Epoll {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl Epoll {
    pub(crate) fn new(config: &Config) -> Result<Epoll, Error> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(Epoll {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; config.max_events],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd) -> Result<(), Error> {
        // Always the full mask: want flags gate the pumps, not the
        // kernel registration.
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLOUT) as u32
                | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Backend for Epoll {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn add(&mut self, reg: &Registration) -> Result<(), Error> {
        self.ctl(libc::EPOLL_CTL_ADD, reg.fd())
    }

    fn del(&mut self, reg: &Registration) -> Result<(), Error> {
        self.ctl(libc::EPOLL_CTL_DEL, reg.fd())
    }

    fn reset(&mut self, reg: &Registration) -> Result<(), Error> {
        self.ctl(libc::EPOLL_CTL_MOD, reg.fd())
    }

    fn wait(
        &mut self,
        _entries: &[Rc<Registration>],
        timeout: Option<Duration>,
    ) -> Result<Vec<Ready>, Error> {
        let count = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epfd.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    timeout_millis(timeout),
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => continue,
                _ => return Err(Error::Io(err)),
            }
        };

        let mut ready = Vec::with_capacity(count);
        for event in &self.events[..count] {
            ready.push(Ready {
                fd: event.u64 as RawFd,
                readable: event.events & READABLE != 0,
                writable: event.events & WRITABLE != 0,
            });
        }
        Ok(ready)
    }
}
