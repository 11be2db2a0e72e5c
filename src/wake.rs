//! Cross-thread wakeup through a self-pipe.
//!
//! A reactor and everything registered on it live on one thread. The
//! one sanctioned way in from other threads is a [`wake_channel`]: a
//! [`crossbeam_channel`] queue paired with a loopback pipe whose read
//! end is registered as an ordinary [`Stream`]. Senders enqueue from
//! any thread and write at most one wake byte per batch; the reactor
//! thread drains the queue and delivers each message to the handler.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Error;
use crate::metrics;
use crate::reactor::Reactor;
use crate::stream::Stream;

/// The sending half of a [`wake_channel`]. `Send + Clone`; usable from
/// any thread.
pub struct WakeSender<T> {
    tx: crossbeam_channel::Sender<T>,
    wake_fd: Arc<OwnedFd>,
    /// True while a wake byte is in flight; cleared by the reactor
    /// side before it drains, so each batch costs one byte.
    pending: Arc<AtomicBool>,
}

impl<T> Clone for WakeSender<T> {
    fn clone(&self) -> Self {
        WakeSender {
            tx: self.tx.clone(),
            wake_fd: Arc::clone(&self.wake_fd),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T: Send + 'static> WakeSender<T> {
    /// Enqueue a message and wake the reactor if it is not already
    /// pending a wake. Fails once the reactor side is closed.
    pub fn send(&self, message: T) -> Result<(), Error> {
        self.tx.send(message).map_err(|_| Error::Closed)?;
        if !self.pending.swap(true, Ordering::AcqRel) {
            let byte = 1u8;
            let rc = unsafe {
                libc::write(
                    self.wake_fd.as_raw_fd(),
                    &byte as *const u8 as *const libc::c_void,
                    1,
                )
            };
            if rc < 0 {
                // Leave the next send responsible for waking.
                self.pending.store(false, Ordering::Release);
                return Err(Error::Io(io::Error::last_os_error()));
            }
            metrics::WAKE_NOTIFICATIONS.increment();
        }
        Ok(())
    }
}

/// Build a wake channel on `reactor`. Returns the sender and the
/// loopback [`Stream`] carrying the wake bytes — close it to tear the
/// channel down. Messages are delivered to `handler` on the reactor
/// thread, in send order, during `run`.
pub fn wake_channel<T: Send + 'static>(
    reactor: &Reactor,
    mut handler: impl FnMut(T) + 'static,
) -> Result<(WakeSender<T>, Stream), Error> {
    let (read_end, write_end) = pipe()?;
    let (tx, rx) = crossbeam_channel::unbounded::<T>();
    let pending = Arc::new(AtomicBool::new(false));

    let stream = Stream::open(reactor, read_end)?;
    let drained_flag = Arc::clone(&pending);
    stream.on_read(move |_, _wake_bytes| {
        // Clear before draining: a message enqueued after this point
        // writes a fresh wake byte.
        drained_flag.store(false, Ordering::Release);
        while let Ok(message) = rx.try_recv() {
            handler(message);
        }
    });

    Ok((
        WakeSender {
            tx,
            wake_fd: Arc::new(write_end),
            pending,
        },
        stream,
    ))
}

/// Create a close-on-exec pipe, `(read_end, write_end)`.
#[cfg(target_os = "linux")]
pub fn pipe() -> Result<(OwnedFd, OwnedFd), Error> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Create a close-on-exec pipe, `(read_end, write_end)`.
#[cfg(not(target_os = "linux"))]
pub fn pipe() -> Result<(OwnedFd, OwnedFd), Error> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    let (read_end, write_end) =
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    crate::io::set_cloexec(read_end.as_raw_fd())?;
    crate::io::set_cloexec(write_end.as_raw_fd())?;
    Ok((read_end, write_end))
}
