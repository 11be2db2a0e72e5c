//! poll(2) backend.
//!
//! Level-triggered; the pollfd vector is rebuilt from the current want
//! flags on every wait, so `add`, `del`, and `reset` have no kernel
//! state to maintain.

use std::io;
use std::rc::Rc;
use std::time::Duration;

use crate::backend::{Backend, Ready, timeout_millis};
use crate::error::Error;
use crate::io::Registration;

const READABLE: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
const WRITABLE: libc::c_short = libc::POLLOUT | libc::POLLERR;

pub(crate) struct Poll {
    fds: Vec<libc::pollfd>,
}

impl Poll {
    pub(crate) fn new() -> Poll {
        Poll { fds: Vec::new() }
    }
}

impl Backend for Poll {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn add(&mut self, _reg: &Registration) -> Result<(), Error> {
        Ok(())
    }

    fn del(&mut self, _reg: &Registration) -> Result<(), Error> {
        Ok(())
    }

    fn wait(
        &mut self,
        entries: &[Rc<Registration>],
        timeout: Option<Duration>,
    ) -> Result<Vec<Ready>, Error> {
        self.fds.clear();
        for reg in entries {
            let mut events: libc::c_short = 0;
            if reg.wants_read() {
                events |= libc::POLLIN;
            }
            if reg.wants_write() {
                events |= libc::POLLOUT;
            }
            self.fds.push(libc::pollfd {
                fd: reg.fd(),
                events,
                revents: 0,
            });
        }

        loop {
            let rc = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    timeout_millis(timeout),
                )
            };
            if rc >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => continue,
                _ => return Err(Error::Io(err)),
            }
        }

        let mut ready = Vec::new();
        for pfd in &self.fds {
            let readable = pfd.revents & READABLE != 0;
            let writable = pfd.revents & WRITABLE != 0;
            if readable || writable {
                ready.push(Ready {
                    fd: pfd.fd,
                    readable,
                    writable,
                });
            }
        }
        Ok(ready)
    }
}
