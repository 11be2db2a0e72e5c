//! select(2) backend.
//!
//! The portable fallback. fd_sets are rebuilt from the current want
//! flags on every wait; descriptors at or beyond `FD_SETSIZE` are
//! refused at registration time.

use std::io;
use std::ptr;
use std::rc::Rc;
use std::time::Duration;

use crate::backend::{Backend, Ready};
use crate::error::Error;
use crate::io::Registration;

pub(crate) struct Select;

impl Select {
    pub(crate) fn new() -> Select {
        Select
    }
}

impl Backend for Select {
    fn name(&self) -> &'static str {
        "select"
    }

    fn add(&mut self, reg: &Registration) -> Result<(), Error> {
        if reg.fd() as usize >= libc::FD_SETSIZE {
            return Err(Error::DescriptorLimit(format!(
                "fd {} exceeds FD_SETSIZE ({})",
                reg.fd(),
                libc::FD_SETSIZE
            )));
        }
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
        loop {
            let mut rset: libc::fd_set = unsafe { std::mem::zeroed() };
            let mut wset: libc::fd_set = unsafe { std::mem::zeroed() };
            unsafe {
                libc::FD_ZERO(&mut rset);
                libc::FD_ZERO(&mut wset);
            }

            let mut max_fd = -1;
            for reg in entries {
                let fd = reg.fd();
                if fd as usize >= libc::FD_SETSIZE {
                    continue;
                }
                let wants_read = reg.wants_read();
                let wants_write = reg.wants_write();
                if wants_read {
                    unsafe { libc::FD_SET(fd, &mut rset) };
                }
                if wants_write {
                    unsafe { libc::FD_SET(fd, &mut wset) };
                }
                if (wants_read || wants_write) && fd > max_fd {
                    max_fd = fd;
                }
            }

            // Linux select mutates the timeval; rebuild it per attempt.
            let mut tv = timeout.map(timeval_ceil);
            let tv_ptr = tv
                .as_mut()
                .map_or(ptr::null_mut(), |tv| tv as *mut libc::timeval);

            let rc = unsafe {
                libc::select(
                    max_fd + 1,
                    &mut rset,
                    &mut wset,
                    ptr::null_mut(),
                    tv_ptr,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(Error::Io(err)),
                }
            }

            let mut ready = Vec::new();
            for reg in entries {
                let fd = reg.fd();
                if fd as usize >= libc::FD_SETSIZE {
                    continue;
                }
                let readable = unsafe { libc::FD_ISSET(fd, &rset) };
                let writable = unsafe { libc::FD_ISSET(fd, &wset) };
                if readable || writable {
                    ready.push(Ready {
                        fd,
                        readable,
                        writable,
                    });
                }
            }
            return Ok(ready);
        }
    }
}

/// Timeout as a timeval, rounded up to the next microsecond.
fn timeval_ceil(timeout: Duration) -> libc::timeval {
    let micros = timeout.as_nanos().div_ceil(1_000);
    libc::timeval {
        tv_sec: (micros / 1_000_000) as libc::time_t,
        tv_usec: (micros % 1_000_000) as libc::suseconds_t,
    }
}
