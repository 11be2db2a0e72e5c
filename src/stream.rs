//! Buffered, queued send/receive on a registered descriptor.
//!
//! A [`Stream`] wraps one non-blocking descriptor. Outbound data is an
//! ordered queue of buffer slices and file slices: consecutive buffer
//! entries drain through a single vectored write, file entries relay
//! through `sendfile` (or a read/write loop off Linux). Inbound data
//! arrives through a scatter read into fixed-size scratch regions, each
//! delivered to the read handler as an owning [`Buffer`] in byte order.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::buffer::Buffer;
use crate::error::Error;
use crate::io::{Driver, Registration, set_nonblocking};
use crate::metrics;
use crate::reactor::{Core, Reactor};
use crate::wheel::TimerCore;

pub(crate) enum SendSource {
    Buffer(Buffer),
    File(File),
}

/// One entry of the outbound queue. `tried` records the bytes offered
/// to the most recent send call so the drain walk can account partial
/// completions.
pub(crate) struct SendEntry {
    source: SendSource,
    offset: u64,
    remaining: usize,
    tried: usize,
}

pub(crate) struct ConnectState {
    pub(crate) connected: bool,
    pub(crate) handler: Option<Box<dyn FnMut(&Stream)>>,
}

struct IdleTimeout {
    delay: Duration,
    timer: Rc<TimerCore>,
}

/// Stream-specific state hanging off a [`Registration`].
pub(crate) struct StreamCore {
    outq: VecDeque<SendEntry>,
    on_read: Option<Box<dyn FnMut(&Stream, Buffer)>>,
    on_write: Option<Box<dyn FnMut(&Stream)>>,
    pub(crate) on_close: Option<Box<dyn FnMut(&Stream)>>,
    on_error: Option<Box<dyn FnMut(&Stream, io::Error)>>,
    on_timeout: Option<Box<dyn FnMut(&Stream)>>,
    pub(crate) connect: Option<ConnectState>,
    idle: Option<IdleTimeout>,
}

impl StreamCore {
    pub(crate) fn new() -> StreamCore {
        StreamCore {
            outq: VecDeque::new(),
            on_read: None,
            on_write: None,
            on_close: None,
            on_error: None,
            on_timeout: None,
            connect: None,
            idle: None,
        }
    }

    pub(crate) fn clear_handlers(&mut self) {
        self.on_read = None;
        self.on_write = None;
        self.on_close = None;
        self.on_error = None;
        self.on_timeout = None;
        self.connect = None;
        self.outq.clear();
    }

    pub(crate) fn take_idle_timer(&mut self) -> Option<Rc<TimerCore>> {
        self.idle.take().map(|idle| idle.timer)
    }
}

/// A buffered stream registered on a reactor.
///
/// `Clone` retains the same underlying descriptor; the reactor holds
/// its own reference until the stream closes.
#[derive(Clone)]
pub struct Stream {
    reg: Rc<Registration>,
    reactor: Weak<Core>,
}

impl Stream {
    /// Adopt a descriptor (socket, pipe end, ...) onto the reactor.
    /// The descriptor is switched to non-blocking mode and watched for
    /// readability immediately.
    pub fn open(reactor: &Reactor, fd: OwnedFd) -> Result<Stream, Error> {
        Self::open_on(reactor.core(), fd)
    }

    pub(crate) fn open_on(core: &Rc<Core>, fd: OwnedFd) -> Result<Stream, Error> {
        set_nonblocking(fd.as_raw_fd())?;
        let reg = Registration::new(fd, Driver::Stream(StreamCore::new()), &core.config);
        core.add(&reg)?;
        Ok(Stream {
            reg,
            reactor: Rc::downgrade(core),
        })
    }

    pub(crate) fn from_parts(core: &Rc<Core>, reg: &Rc<Registration>) -> Stream {
        Stream {
            reg: Rc::clone(reg),
            reactor: Rc::downgrade(core),
        }
    }

    pub(crate) fn register(
        core: &Rc<Core>,
        fd: OwnedFd,
        stream_core: StreamCore,
    ) -> Result<Stream, Error> {
        let reg = Registration::new(fd, Driver::Stream(stream_core), &core.config);
        core.add(&reg)?;
        Ok(Stream {
            reg,
            reactor: Rc::downgrade(core),
        })
    }

    /// The raw descriptor.
    pub fn fd(&self) -> RawFd {
        self.reg.fd()
    }

    /// Set the handler invoked once per received [`Buffer`], in byte
    /// order.
    pub fn on_read(&self, handler: impl FnMut(&Stream, Buffer) + 'static) {
        if let Some(core) = self.reg.driver.borrow_mut().stream_mut() {
            core.on_read = Some(Box::new(handler));
        }
    }

    /// Set the handler invoked each time the outbound queue fully
    /// drains.
    pub fn on_write(&self, handler: impl FnMut(&Stream) + 'static) {
        if let Some(core) = self.reg.driver.borrow_mut().stream_mut() {
            core.on_write = Some(Box::new(handler));
        }
    }

    /// Set the handler invoked exactly once when the stream closes.
    pub fn on_close(&self, handler: impl FnMut(&Stream) + 'static) {
        if let Some(core) = self.reg.driver.borrow_mut().stream_mut() {
            core.on_close = Some(Box::new(handler));
        }
    }

    /// Set the handler invoked on a fatal I/O error, before the close
    /// handler. Transient `EAGAIN`/`EINTR` conditions never reach it.
    pub fn on_error(&self, handler: impl FnMut(&Stream, io::Error) + 'static) {
        if let Some(core) = self.reg.driver.borrow_mut().stream_mut() {
            core.on_error = Some(Box::new(handler));
        }
    }

    /// Set the handler invoked when the idle timeout set with
    /// [`set_timeout`](Stream::set_timeout) elapses without activity.
    pub fn on_timeout(&self, handler: impl FnMut(&Stream) + 'static) {
        if let Some(core) = self.reg.driver.borrow_mut().stream_mut() {
            core.on_timeout = Some(Box::new(handler));
        }
    }

    /// Arm (or re-arm) an idle timeout. The timeout resets on every
    /// delivered read and every completed write; when it elapses the
    /// timeout handler runs once, and the next activity re-arms it.
    pub fn set_timeout(&self, delay: Duration) -> Result<(), Error> {
        let reactor = self.reactor.upgrade().ok_or(Error::ReactorGone)?;
        if self.reg.is_closed() {
            return Err(Error::Closed);
        }
        let weak_core = Rc::downgrade(&reactor);
        let weak_reg = Rc::downgrade(&self.reg);
        let timer = TimerCore::new(Box::new(move |_| {
            if let (Some(core), Some(reg)) = (weak_core.upgrade(), weak_reg.upgrade()) {
                fire_timeout(&core, &reg);
            }
        }));
        let previous = self
            .reg
            .driver
            .borrow_mut()
            .stream_mut()
            .and_then(|s| s.take_idle_timer());
        let mut wheel = reactor.wheel.borrow_mut();
        if let Some(previous) = previous {
            wheel.cancel(&previous);
        }
        wheel.arm(&timer, delay);
        drop(wheel);
        if let Some(core) = self.reg.driver.borrow_mut().stream_mut() {
            core.idle = Some(IdleTimeout { delay, timer });
        }
        Ok(())
    }

    /// Append a slice of `buffer` to the outbound queue.
    ///
    /// `offset` is clamped to the buffer, `count == 0` means "rest of
    /// the buffer". The stream retains the buffer until the bytes are
    /// sent. Entries drain strictly in push order.
    pub fn push_buffer(&self, buffer: &Buffer, offset: usize, count: usize) -> Result<(), Error> {
        if self.reg.is_closed() || self.reg.shutdown_requested() {
            return Err(Error::Closed);
        }
        let offset = offset.min(buffer.len());
        let rest = buffer.len() - offset;
        let count = if count == 0 { rest } else { count.min(rest) };
        if count == 0 {
            return Ok(());
        }
        {
            let mut driver = self.reg.driver.borrow_mut();
            let Some(core) = driver.stream_mut() else {
                return Err(Error::Closed);
            };
            core.outq.push_back(SendEntry {
                source: SendSource::Buffer(buffer.clone()),
                offset: offset as u64,
                remaining: count,
                tried: 0,
            });
        }
        self.mark_writable()
    }

    /// Append a slice of `file` to the outbound queue, relayed to the
    /// descriptor without passing through userspace where the platform
    /// allows. `count == 0` means "rest of the file" per its current
    /// size.
    pub fn push_file(&self, file: File, offset: u64, count: usize) -> Result<(), Error> {
        if self.reg.is_closed() || self.reg.shutdown_requested() {
            return Err(Error::Closed);
        }
        let size = file.metadata().map_err(Error::Io)?.len();
        let offset = offset.min(size);
        let rest = (size - offset) as usize;
        let count = if count == 0 { rest } else { count.min(rest) };
        if count == 0 {
            return Ok(());
        }
        {
            let mut driver = self.reg.driver.borrow_mut();
            let Some(core) = driver.stream_mut() else {
                return Err(Error::Closed);
            };
            core.outq.push_back(SendEntry {
                source: SendSource::File(file),
                offset,
                remaining: count,
                tried: 0,
            });
        }
        self.mark_writable()
    }

    /// Format into a fresh buffer and push it (the printf path).
    /// Usable via `write!(stream, "...")`.
    pub fn write_fmt(&self, args: fmt::Arguments<'_>) -> Result<(), Error> {
        let buffer = Buffer::format(args);
        self.push_buffer(&buffer, 0, 0)
    }

    /// Graceful close: stop reading, deliver everything still queued,
    /// then close and fire the close handler.
    pub fn shutdown(&self) {
        self.reg.request_shutdown();
    }

    /// Immediate close: discard queued data and close at the next
    /// reactor pass. The close handler still fires exactly once.
    pub fn close(&self) {
        self.reg.hard_close();
    }

    /// Watch for write readiness to learn the outcome of an
    /// in-progress connect. Reads wait until the connect completes so
    /// an error-flagged readiness resolves through `SO_ERROR`, not a
    /// premature `readv`.
    pub(crate) fn mark_connect_pending(&self) {
        self.reg.read.want.set(false);
        self.reg.write.want.set(true);
        if let Some(reactor) = self.reactor.upgrade() {
            let _ = reactor.backend.borrow_mut().reset(&self.reg);
        }
    }

    /// Deliver the connect handler for a connect that completed
    /// synchronously.
    pub(crate) fn fire_connect_now(&self) {
        let handler = self
            .reg
            .driver
            .borrow_mut()
            .stream_mut()
            .and_then(|s| s.connect.as_mut().and_then(|c| c.handler.take()));
        if let Some(mut handler) = handler {
            handler(self);
        }
    }

    fn mark_writable(&self) -> Result<(), Error> {
        self.reg.write.want.set(true);
        let reactor = self.reactor.upgrade().ok_or(Error::ReactorGone)?;
        // Edge-triggered backends need a fresh edge once data is queued;
        // rebuild-per-call backends treat this as a no-op.
        let _ = reactor.backend.borrow_mut().reset(&self.reg);
        Ok(())
    }
}

/// One read-pump iteration: scatter-read into `pass` scratch regions
/// and deliver each filled region as an owning [`Buffer`].
pub(crate) fn perf_read(core: &Rc<Core>, reg: &Rc<Registration>, pass: u8) {
    let region_size = core.config.read_buffer_size;
    let count = pass.max(1) as usize;
    let mut regions: Vec<Vec<u8>> = (0..count).map(|_| vec![0u8; region_size]).collect();
    let iov: Vec<libc::iovec> = regions
        .iter_mut()
        .map(|region| libc::iovec {
            iov_base: region.as_mut_ptr() as *mut libc::c_void,
            iov_len: region.len(),
        })
        .collect();

    let n = unsafe { libc::readv(reg.fd(), iov.as_ptr(), iov.len() as libc::c_int) };
    if n == 0 {
        // Peer closed its end.
        reg.read.can.set(false);
        reg.request_shutdown();
        return;
    }
    if n < 0 {
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => reg.read.can.set(false),
            io::ErrorKind::Interrupted => reg.read.can.set(true),
            _ => fatal_error(core, reg, err),
        }
        return;
    }

    let n = n as usize;
    metrics::BYTES_RECEIVED.add(n as u64);
    reg.read.can.set(true);
    touch_idle(core, reg);

    let handler = reg
        .driver
        .borrow_mut()
        .stream_mut()
        .and_then(|s| s.on_read.take());
    let Some(mut handler) = handler else {
        // Nobody listening; a short read still means the kernel drained.
        if n < count * region_size {
            reg.read.can.set(false);
        }
        return;
    };

    let stream = Stream::from_parts(core, reg);
    let mut drain = n;
    for mut region in regions {
        if drain == 0 {
            break;
        }
        let take = drain.min(region.len());
        if take < region.len() {
            // Short region: the kernel buffer is empty.
            reg.read.can.set(false);
        }
        region.truncate(take);
        drain -= take;
        handler(&stream, Buffer::new(region));
    }

    let mut driver = reg.driver.borrow_mut();
    if let Some(stream_core) = driver.stream_mut()
        && stream_core.on_read.is_none()
    {
        stream_core.on_read = Some(handler);
    }
}

/// One write-pump iteration: finish an in-progress connect if any,
/// otherwise send from the queue head and account the result.
pub(crate) fn perf_write(core: &Rc<Core>, reg: &Rc<Registration>) {
    let connecting = reg
        .driver
        .borrow_mut()
        .stream_mut()
        .is_some_and(|s| s.connect.as_ref().is_some_and(|c| !c.connected));
    if connecting {
        complete_connect(core, reg);
        return;
    }

    match sys_write(core, reg) {
        Err(err) => match err.kind() {
            io::ErrorKind::WouldBlock => reg.write.can.set(false),
            io::ErrorKind::Interrupted => reg.write.can.set(true),
            _ => fatal_error(core, reg, err),
        },
        Ok(0) => {
            // Source exhausted (empty queue, or a file shorter than
            // promised). Drop a stale head so the queue cannot wedge.
            let emptied = {
                let mut driver = reg.driver.borrow_mut();
                match driver.stream_mut() {
                    Some(s) => {
                        s.outq.pop_front();
                        s.outq.is_empty()
                    }
                    None => true,
                }
            };
            if emptied {
                reg.write.want.set(false);
            }
        }
        Ok(n) => {
            metrics::BYTES_SENT.add(n as u64);
            reg.write.can.set(true);
            touch_idle(core, reg);
            if drain_outq(reg, n) {
                reg.write.want.set(false);
                fire_write_drained(core, reg);
            }
        }
    }
}

/// Send from the queue head: a run of consecutive buffer entries via
/// one vectored write, or a file head entry via the relay path.
fn sys_write(core: &Rc<Core>, reg: &Rc<Registration>) -> io::Result<usize> {
    let mut driver = reg.driver.borrow_mut();
    let Some(stream) = driver.stream_mut() else {
        return Ok(0);
    };
    let Some(front) = stream.outq.front() else {
        return Ok(0);
    };
    match front.source {
        SendSource::Buffer(_) => sys_writev(reg.fd(), stream, core.config.write_batch),
        SendSource::File(_) => sys_send_file(reg.fd(), stream),
    }
}

fn sys_writev(fd: RawFd, stream: &mut StreamCore, batch: usize) -> io::Result<usize> {
    let mut iov: Vec<libc::iovec> = Vec::with_capacity(batch);
    for entry in stream.outq.iter_mut() {
        if iov.len() == batch {
            break;
        }
        let SendSource::Buffer(ref buffer) = entry.source else {
            break;
        };
        entry.tried = entry.remaining;
        let slice = &buffer.as_slice()[entry.offset as usize..];
        iov.push(libc::iovec {
            iov_base: slice.as_ptr() as *mut libc::c_void,
            iov_len: entry.remaining,
        });
    }
    let n = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(target_os = "linux")]
fn sys_send_file(fd: RawFd, stream: &mut StreamCore) -> io::Result<usize> {
    let Some(front) = stream.outq.front_mut() else {
        return Ok(0);
    };
    let SendSource::File(ref file) = front.source else {
        return Ok(0);
    };
    front.tried = front.remaining;
    // The kernel advances its own copy of the offset; the drain walk
    // advances the entry's.
    let mut offset: libc::off_t = front.offset as libc::off_t;
    let n = unsafe { libc::sendfile(fd, file.as_raw_fd(), &mut offset, front.remaining) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(not(target_os = "linux"))]
fn sys_send_file(fd: RawFd, stream: &mut StreamCore) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;

    const CHUNK: usize = 16 * 1024;

    let Some(front) = stream.outq.front_mut() else {
        return Ok(0);
    };
    let SendSource::File(ref file) = front.source else {
        return Ok(0);
    };
    front.tried = front.remaining;
    let mut scratch = vec![0u8; front.remaining.min(CHUNK)];
    let read = file.read_at(&mut scratch, front.offset)?;
    if read == 0 {
        return Ok(0);
    }
    let n = unsafe { libc::write(fd, scratch.as_ptr() as *const libc::c_void, read) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Walk the queue from the head, consuming `n` acknowledged bytes.
/// Fully drained entries unlink and release in order; a partially
/// drained entry advances and stops the walk. Returns whether the
/// queue just became empty.
fn drain_outq(reg: &Rc<Registration>, n: usize) -> bool {
    let mut driver = reg.driver.borrow_mut();
    let Some(stream) = driver.stream_mut() else {
        return false;
    };
    let had_entries = !stream.outq.is_empty();
    let mut drain = n;
    while drain > 0 {
        let Some(front) = stream.outq.front_mut() else {
            break;
        };
        if drain < front.tried {
            front.offset += drain as u64;
            front.remaining -= drain;
            // The kernel took less than offered: its buffer is full.
            reg.write.can.set(false);
            drain = 0;
        } else {
            drain -= front.tried;
            stream.outq.pop_front();
        }
    }
    had_entries && stream.outq.is_empty()
}

fn fire_write_drained(core: &Rc<Core>, reg: &Rc<Registration>) {
    let handler = reg
        .driver
        .borrow_mut()
        .stream_mut()
        .and_then(|s| s.on_write.take());
    if let Some(mut handler) = handler {
        handler(&Stream::from_parts(core, reg));
        let mut driver = reg.driver.borrow_mut();
        if let Some(stream) = driver.stream_mut()
            && stream.on_write.is_none()
        {
            stream.on_write = Some(handler);
        }
    }
}

/// Non-blocking connect completion: consult `SO_ERROR` on write
/// readiness, fire the connect handler once on success, take the fatal
/// path on failure.
fn complete_connect(core: &Rc<Core>, reg: &Rc<Registration>) {
    let mut err_code: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            reg.fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err_code as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == -1 {
        fatal_error(core, reg, io::Error::last_os_error());
        return;
    }
    if err_code == libc::EINPROGRESS {
        return;
    }
    if err_code != 0 {
        fatal_error(core, reg, io::Error::from_raw_os_error(err_code));
        return;
    }

    metrics::CONNECTIONS_ESTABLISHED.increment();
    let handler = {
        let mut driver = reg.driver.borrow_mut();
        match driver.stream_mut().and_then(|s| s.connect.as_mut()) {
            Some(connect) => {
                connect.connected = true;
                connect.handler.take()
            }
            None => None,
        }
    };
    // Connected: start wanting reads (unless already shutting down),
    // and let data queued by the connect handler flush in this cycle.
    if !reg.shutdown_requested() {
        reg.read.want.set(true);
    }
    let _ = core.backend.borrow_mut().reset(reg);
    reg.write.can.set(true);
    if let Some(mut handler) = handler {
        handler(&Stream::from_parts(core, reg));
    }
}

/// Fatal error path: hard-close the descriptor and deliver the error
/// handler; the close handler follows when the close finalizes.
pub(crate) fn fatal_error(core: &Rc<Core>, reg: &Rc<Registration>, err: io::Error) {
    reg.hard_close();
    let handler = reg
        .driver
        .borrow_mut()
        .stream_mut()
        .and_then(|s| s.on_error.take());
    if let Some(mut handler) = handler {
        handler(&Stream::from_parts(core, reg), err);
        let mut driver = reg.driver.borrow_mut();
        if let Some(stream) = driver.stream_mut()
            && stream.on_error.is_none()
        {
            stream.on_error = Some(handler);
        }
    }
}

/// Re-arm the idle timeout after read or write activity.
fn touch_idle(core: &Rc<Core>, reg: &Rc<Registration>) {
    let idle = reg
        .driver
        .borrow_mut()
        .stream_mut()
        .and_then(|s| s.idle.as_ref().map(|i| (i.delay, Rc::clone(&i.timer))));
    if let Some((delay, timer)) = idle {
        let mut wheel = core.wheel.borrow_mut();
        wheel.cancel(&timer);
        wheel.arm(&timer, delay);
    }
}

fn fire_timeout(core: &Rc<Core>, reg: &Rc<Registration>) {
    if reg.is_closed() {
        return;
    }
    let handler = reg
        .driver
        .borrow_mut()
        .stream_mut()
        .and_then(|s| s.on_timeout.take());
    if let Some(mut handler) = handler {
        handler(&Stream::from_parts(core, reg));
        let mut driver = reg.driver.borrow_mut();
        if let Some(stream) = driver.stream_mut()
            && stream.on_timeout.is_none()
        {
            stream.on_timeout = Some(handler);
        }
    }
}
